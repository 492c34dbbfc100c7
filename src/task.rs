//! Task payload types shared across the engine.
//!
//! A [`Task`] describes a single lifecycle transition for a membership
//! application. Tasks are serialized as JSON by the submission API, queued in
//! RabbitMQ, and decoded here when the engine consumes them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A lifecycle-transition task for one membership application.
///
/// # Fields
///
/// - `id`: 24-hex-char identifier of the application record
/// - `username`: the applicant's in-game name
/// - `email`: the applicant's contact address
/// - `status`: which transition to carry out; selects the handler
///
/// Any additional fields on the wire are preserved verbatim in `extra` but
/// never interpreted by the engine.
///
/// # Example
///
/// ```json
/// {
///   "_id": "6650f2a1b9d4c5e6f7a8b9c0",
///   "username": "alice",
///   "email": "alice@example.com",
///   "status": "Pending"
/// }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Task {
    /// Identifier of the underlying application record
    #[serde(rename = "_id")]
    pub id: String,

    /// Applicant's in-game username
    #[serde(default)]
    pub username: String,

    /// Applicant's contact e-mail
    #[serde(default)]
    pub email: String,

    /// Requested lifecycle transition
    pub status: Status,

    /// Opaque application fields carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Task {
    /// Decode a task from a delivery body.
    ///
    /// Missing `_id` or `status` is an error; unknown fields are preserved.
    /// An undecodable body is acknowledged-and-dropped by the caller since it
    /// can never be interpreted, no matter how often it is redelivered.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Lifecycle state requested by a task.
///
/// Wire values the engine does not recognize decode to [`Status::Unknown`]
/// so the delivery can still be acknowledged instead of poisoning the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Pending,
    Approved,
    Denied,
    Deactivated,
    Banned,
    Unknown,
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "Pending" => Status::Pending,
            "Approved" => Status::Approved,
            "Denied" => Status::Denied,
            "Deactivated" => Status::Deactivated,
            "Banned" => Status::Banned,
            _ => Status::Unknown,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Pending => "Pending",
            Status::Approved => "Approved",
            Status::Denied => "Denied",
            Status::Deactivated => "Deactivated",
            Status::Banned => "Banned",
            Status::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// What the game server currently believes about a user, as persisted on the
/// application document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum OnserverStatus {
    None,
    Whitelisted,
    Banned,
}

impl OnserverStatus {
    /// Wire string persisted in the document store.
    pub fn as_str(&self) -> &'static str {
        match self {
            OnserverStatus::None => "None",
            OnserverStatus::Whitelisted => "Whitelisted",
            OnserverStatus::Banned => "Banned",
        }
    }
}

impl fmt::Display for OnserverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
