//! RCON client for issuing console commands on the game server.
//!
//! The RCON wire format frames each packet as a little-endian length prefix
//! followed by a request id, a packet type, a command body, and two NUL
//! terminators. The client authenticates once at connect time and then sends
//! one command per request, matching replies by request id.
//!
//! The whitelist and ban commands the engine issues are idempotent on the
//! server, so a command replayed by the retry cycle is harmless.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::services::{GameRpc, RpcError};

const TYPE_AUTH: i32 = 3;
const TYPE_AUTH_RESPONSE: i32 = 2;
const TYPE_EXEC_COMMAND: i32 = 2;

/// Replies larger than this are not something `whitelist` or `ban` produce.
const MAX_PAYLOAD_LEN: usize = 4096;

/// Errors from the RCON transport.
#[derive(Debug, Error)]
pub enum RconError {
    #[error("I/O error talking to the game server: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication rejected by the game server")]
    AuthRejected,

    #[error("malformed packet from the game server: {0}")]
    Protocol(String),
}

/// One decoded RCON packet.
#[derive(Debug, PartialEq, Eq)]
struct Packet {
    id: i32,
    kind: i32,
    body: String,
}

/// A connected, authenticated RCON client.
///
/// Requests are serialized through a mutex; the protocol has no pipelining
/// worth the complexity for two commands a minute.
pub struct RconClient {
    stream: Mutex<TcpStream>,
    next_id: AtomicI32,
}

impl RconClient {
    /// Dial the server and authenticate with the configured password.
    pub async fn connect(host: &str, port: u16, password: &str) -> Result<Self, RconError> {
        let stream = TcpStream::connect((host, port)).await?;
        let client = Self {
            stream: Mutex::new(stream),
            next_id: AtomicI32::new(1),
        };
        client.authenticate(password).await?;
        debug!(host, port, "RCON session established");
        Ok(client)
    }

    async fn authenticate(&self, password: &str) -> Result<(), RconError> {
        let id = self.claim_id();
        let mut stream = self.stream.lock().await;
        stream.write_all(&encode_packet(id, TYPE_AUTH, password)).await?;

        // Some servers send an empty response value before the auth reply
        loop {
            let packet = read_packet(&mut stream).await?;
            if packet.kind == TYPE_AUTH_RESPONSE {
                // A rejected password answers with id -1
                if packet.id == id {
                    return Ok(());
                }
                return Err(RconError::AuthRejected);
            }
        }
    }

    async fn exec(&self, command: &str) -> Result<String, RconError> {
        let id = self.claim_id();
        let mut stream = self.stream.lock().await;
        stream
            .write_all(&encode_packet(id, TYPE_EXEC_COMMAND, command))
            .await?;

        let packet = read_packet(&mut stream).await?;
        if packet.id != id {
            return Err(RconError::Protocol(format!(
                "reply id {} does not match request id {}",
                packet.id, id
            )));
        }
        Ok(packet.body)
    }

    fn claim_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl GameRpc for RconClient {
    async fn send_command(&self, command: &str) -> Result<String, RpcError> {
        self.exec(command)
            .await
            .map_err(|err| RpcError::Command(err.to_string()))
    }
}

/// Frame a packet: `<len><id><kind><body>\0\0`, all integers little-endian.
fn encode_packet(id: i32, kind: i32, body: &str) -> Vec<u8> {
    let payload_len = 4 + 4 + body.len() + 2;
    let mut buf = Vec::with_capacity(4 + payload_len);
    buf.extend_from_slice(&(payload_len as i32).to_le_bytes());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(body.as_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf
}

/// Decode a length-stripped payload into a packet.
fn decode_payload(payload: &[u8]) -> Result<Packet, RconError> {
    if payload.len() < 10 {
        return Err(RconError::Protocol(format!(
            "payload of {} bytes is below the 10-byte minimum",
            payload.len()
        )));
    }

    let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let kind = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let body = String::from_utf8_lossy(&payload[8..payload.len() - 2]).into_owned();

    Ok(Packet { id, kind, body })
}

async fn read_packet(stream: &mut TcpStream) -> Result<Packet, RconError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = i32::from_le_bytes(len_buf);

    if len < 10 || len as usize > MAX_PAYLOAD_LEN {
        return Err(RconError::Protocol(format!(
            "declared payload length {len} is outside 10..={MAX_PAYLOAD_LEN}"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    decode_payload(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_frames_length_and_terminators() {
        let packet = encode_packet(7, TYPE_EXEC_COMMAND, "whitelist add tywin");
        let body_len = "whitelist add tywin".len();

        // length prefix covers id + kind + body + two NULs
        assert_eq!(
            i32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]),
            (8 + body_len + 2) as i32
        );
        assert_eq!(&packet[packet.len() - 2..], &[0, 0]);
    }

    #[test]
    fn decode_inverts_encode() {
        let encoded = encode_packet(42, TYPE_AUTH, "secret");
        let decoded = decode_payload(&encoded[4..]).unwrap();

        assert_eq!(
            decoded,
            Packet {
                id: 42,
                kind: TYPE_AUTH,
                body: "secret".to_string(),
            }
        );
    }

    #[test]
    fn decode_empty_body() {
        let encoded = encode_packet(-1, TYPE_AUTH_RESPONSE, "");
        let decoded = decode_payload(&encoded[4..]).unwrap();
        assert_eq!(decoded.id, -1);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn decode_rejects_short_payloads() {
        assert!(decode_payload(&[0u8; 9]).is_err());
    }

    #[tokio::test]
    async fn exec_round_trip_against_scripted_server() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // Auth request: echo the id back as accepted
            let auth = read_packet(&mut socket).await.unwrap();
            assert_eq!(auth.kind, TYPE_AUTH);
            assert_eq!(auth.body, "hunter2");
            socket
                .write_all(&encode_packet(auth.id, TYPE_AUTH_RESPONSE, ""))
                .await
                .unwrap();

            // Command request: reply with a canned confirmation
            let exec = read_packet(&mut socket).await.unwrap();
            assert_eq!(exec.body, "whitelist add tywin");
            socket
                .write_all(&encode_packet(exec.id, 0, "Added tywin to the whitelist"))
                .await
                .unwrap();
        });

        let client = RconClient::connect(&addr.ip().to_string(), addr.port(), "hunter2")
            .await
            .unwrap();
        let reply = client.send_command("whitelist add tywin").await.unwrap();

        assert_eq!(reply, "Added tywin to the whitelist");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_fails_on_rejected_password() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let auth = read_packet(&mut socket).await.unwrap();
            assert_eq!(auth.kind, TYPE_AUTH);
            // Rejection is signalled with id -1
            socket
                .write_all(&encode_packet(-1, TYPE_AUTH_RESPONSE, ""))
                .await
                .unwrap();
        });

        let result = RconClient::connect(&addr.ip().to_string(), addr.port(), "wrong").await;
        assert!(matches!(result, Err(RconError::AuthRejected)));
    }
}
