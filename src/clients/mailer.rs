//! Mailer adapter posting to an HTTP mail-relay service.
//!
//! Template rendering and SMTP delivery live in the relay; the engine only
//! names a template, a substitution map, a subject, and a recipient.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::services::{MailError, Mailer};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Mailer that POSTs delivery requests to a relay endpoint.
#[derive(Debug, Clone)]
pub struct RelayMailer {
    client: Client,
    relay_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl RelayMailer {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            relay_url: relay_url.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bearer token expected by the relay.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Delivery request body understood by the relay.
fn build_payload(
    template: &str,
    substitutions: &HashMap<String, String>,
    subject: &str,
    recipient: &str,
) -> Value {
    json!({
        "template": template,
        "substitutions": substitutions,
        "subject": subject,
        "to": recipient,
    })
}

#[async_trait]
impl Mailer for RelayMailer {
    async fn send(
        &self,
        template: &str,
        substitutions: HashMap<String, String>,
        subject: &str,
        recipient: &str,
    ) -> Result<(), MailError> {
        let payload = build_payload(template, &substitutions, subject, recipient);

        let mut request = self
            .client
            .post(&self.relay_url)
            .timeout(self.timeout)
            .json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| MailError::Delivery(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(recipient, template, "Mail accepted by relay");
            Ok(())
        } else {
            warn!(recipient, status = %status, "Mail relay rejected the request");
            Err(MailError::Delivery(format!(
                "relay returned status {status}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_settings() {
        let mailer = RelayMailer::new("https://relay.example.com/send")
            .with_api_key("sk_test")
            .with_timeout(Duration::from_secs(3));

        assert_eq!(mailer.relay_url, "https://relay.example.com/send");
        assert_eq!(mailer.api_key.as_deref(), Some("sk_test"));
        assert_eq!(mailer.timeout, Duration::from_secs(3));
    }

    #[test]
    fn payload_carries_all_fields() {
        let substitutions =
            HashMap::from([("link".to_string(), "https://gate.example.com/x".to_string())]);
        let payload = build_payload(
            "templates/ops.html",
            &substitutions,
            "[Action Required] Whitelist request from alice",
            "m1@x",
        );

        assert_eq!(payload["template"], "templates/ops.html");
        assert_eq!(payload["to"], "m1@x");
        assert_eq!(
            payload["substitutions"]["link"],
            "https://gate.example.com/x"
        );
        assert!(payload["subject"]
            .as_str()
            .unwrap()
            .contains("alice"));
    }
}
