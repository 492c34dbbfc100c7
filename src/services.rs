//! Capability interfaces consumed by the engine.
//!
//! The engine does not own a document-store driver, a mail client, a cache
//! store, or a game-server transport; it orchestrates them through the traits
//! defined here. The [`clients`](crate::clients) module ships default
//! adapters, and tests substitute in-memory doubles.
//!
//! All implementations must be safe for concurrent use: the stats tick and
//! the main dispatch loop share them through `Arc`.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::task::{OnserverStatus, Task};

/// Errors from the application document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store request failed: {0}")]
    Request(String),

    #[error("document store rejected the update: {0}")]
    Rejected(String),
}

/// Errors from the statistics cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache operation failed: {0}")]
    Operation(String),
}

/// Errors from the mail service.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

/// Errors from the game-server RPC client.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("game server command failed: {0}")]
    Command(String),

    #[error("game server client is disabled in this environment")]
    Disabled,
}

/// A partial update for one application document.
///
/// Only the fields the engine mutates are representable; the adapter turns a
/// patch into the store's native `$set` change set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPatch {
    /// Moderators who successfully received action e-mails
    pub assignees: Option<Vec<String>>,

    /// Persisted view of the user's standing on the game server
    pub onserver_status: Option<OnserverStatus>,
}

impl RequestPatch {
    /// Patch that records the action-mail recipients.
    pub fn with_assignees(assignees: Vec<String>) -> Self {
        Self {
            assignees: Some(assignees),
            ..Self::default()
        }
    }

    /// Patch that records the user's on-server standing.
    pub fn with_onserver_status(status: OnserverStatus) -> Self {
        Self {
            onserver_status: Some(status),
            ..Self::default()
        }
    }
}

/// Persistence for application documents.
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Apply `patch` to the application identified by `id`.
    async fn update_request(&self, id: &str, patch: RequestPatch) -> Result<(), StoreError>;
}

/// Aggregate-statistics cache. All operations are best-effort from the
/// engine's perspective; failures are logged and processing continues.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Refresh the cached listing of all applications.
    async fn update_all_requests(&self) -> Result<(), CacheError>;

    /// Fold one task into the real-time statistics.
    async fn update_real_time_stats(&self, task: &Task) -> Result<(), CacheError>;

    /// Recompute the aggregate statistics snapshot.
    async fn update_aggregate_stats(&self) -> Result<(), CacheError>;
}

/// Outbound templated e-mail.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Render `template` with `substitutions` and deliver it to `recipient`.
    async fn send(
        &self,
        template: &str,
        substitutions: HashMap<String, String>,
        subject: &str,
        recipient: &str,
    ) -> Result<(), MailError>;
}

/// Text-command RPC against the game server.
#[async_trait]
pub trait GameRpc: Send + Sync {
    /// Issue a console command (e.g. `whitelist add alice`) and return the
    /// server's textual reply.
    async fn send_command(&self, command: &str) -> Result<String, RpcError>;
}
