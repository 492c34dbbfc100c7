//! Link tokens for e-mailed action and status URLs.
//!
//! Decision, confirmation, and moderator-action e-mails embed URLs that
//! identify an application (and for moderators, the recipient) without
//! exposing raw identifiers. A token is the hex-encoded value followed by a
//! truncated HMAC-SHA256 tag keyed with the configured passphrase, so the
//! front-end can reject tampered links without a shared database lookup.
//!
//! Tokens are deterministic for a given passphrase, which keeps retried
//! handler runs from generating links that differ from the ones already
//! mailed out.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Bytes of the MAC kept in the token; 16 is plenty for link integrity.
const TAG_LEN: usize = 16;

/// Seal a value into a URL-safe token keyed by the passphrase.
pub fn seal(value: &str, passphrase: &str) -> String {
    let tag = compute_tag(value.as_bytes(), passphrase.as_bytes());
    format!("{}.{}", hex::encode(value.as_bytes()), hex::encode(tag))
}

/// Open a token, returning the sealed value if the tag verifies.
///
/// Returns `None` for malformed tokens, invalid hex, non-UTF-8 payloads, or
/// tag mismatches. Never panics.
pub fn open(token: &str, passphrase: &str) -> Option<String> {
    let (body, tag) = token.split_once('.')?;
    let value = hex::decode(body).ok()?;
    let tag = hex::decode(tag).ok()?;

    let mut mac = HmacSha256::new_from_slice(passphrase.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(&value);
    // Constant-time comparison via the HMAC library
    mac.verify_truncated_left(&tag).ok()?;

    String::from_utf8(value).ok()
}

fn compute_tag(value: &[u8], key: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(value);
    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_is_deterministic() {
        let a = seal("6650f2a1b9d4c5e6f7a8b9c0", "hunter2");
        let b = seal("6650f2a1b9d4c5e6f7a8b9c0", "hunter2");
        assert_eq!(a, b);
    }

    #[test]
    fn seal_depends_on_passphrase() {
        let a = seal("6650f2a1b9d4c5e6f7a8b9c0", "hunter2");
        let b = seal("6650f2a1b9d4c5e6f7a8b9c0", "different");
        assert_ne!(a, b);
    }

    #[test]
    fn token_is_url_safe() {
        let token = seal("mod+review@example.com", "hunter2");
        assert!(token
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '.'));
    }

    #[test]
    fn open_returns_sealed_value() {
        let token = seal("mod@example.com", "hunter2");
        assert_eq!(open(&token, "hunter2").as_deref(), Some("mod@example.com"));
    }

    #[test]
    fn open_rejects_wrong_passphrase() {
        let token = seal("mod@example.com", "hunter2");
        assert_eq!(open(&token, "not-hunter2"), None);
    }

    #[test]
    fn open_rejects_tampered_body() {
        let token = seal("mod@example.com", "hunter2");
        let mut chars: Vec<char> = token.chars().collect();
        chars[0] = if chars[0] == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();
        assert_eq!(open(&tampered, "hunter2"), None);
    }

    #[test]
    fn open_rejects_malformed_tokens() {
        assert_eq!(open("", "hunter2"), None);
        assert_eq!(open("no-separator", "hunter2"), None);
        assert_eq!(open("zz.zz", "hunter2"), None);
        assert_eq!(open("6d.0000", "hunter2"), None);
    }
}
