//! # Gatekeeper Task Engine
//!
//! The asynchronous core of a gatekeeping service that moderates membership
//! applications for a multiplayer game server. External collaborators (the
//! HTTP submission API, the moderator UI) publish lifecycle-transition tasks
//! to a durable RabbitMQ exchange; this crate consumes them and carries out
//! the side effects: administrative commands on the game server, templated
//! e-mails, document-store updates, and cache maintenance.
//!
//! ## Architecture
//!
//! ```text
//! Front-end -> work.ex -> work.queue -> Engine -> Handlers -> Effects
//!                            ^                        |
//!                            |                     (failure)
//!                         work.ex <- TTL <- retry.queue <- retry.ex
//! ```
//!
//! A message that cannot be processed is republished to `retry.ex` with a
//! per-message expiration. The retry queue has no consumer; when the TTL
//! elapses the broker dead-letters the message back to `work.ex`, which gives
//! delayed redelivery with exponential backoff and no local timers.
//!
//! ## Modules
//!
//! - [`task`]: Task payload types and the wire codec
//! - [`broker`]: RabbitMQ session, topology, and close-event surface
//! - [`retry`]: the bounded exponential-backoff republish decision
//! - [`dispatch`]: moderator selection strategies
//! - [`handlers`]: per-status task handlers
//! - [`engine`]: the main dispatch loop and reconnect supervisor
//! - [`services`]: capability interfaces consumed by the handlers
//! - [`clients`]: default adapters behind the capability interfaces

pub mod broker;
pub mod clients;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod handlers;
pub mod retry;
pub mod services;
pub mod shutdown;
pub mod task;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at crate root
pub use config::GatekeeperConfig;
pub use engine::{Engine, Services};
pub use task::{OnserverStatus, Status, Task};

/// Fanout exchange the front-end publishes work to
pub const WORK_EXCHANGE: &str = "work.ex";

/// Queue the engine consumes; dead-letters expired messages to [`RETRY_EXCHANGE`]
pub const WORK_QUEUE: &str = "work.queue";

/// Fanout exchange for delayed redelivery
pub const RETRY_EXCHANGE: &str = "retry.ex";

/// Holding queue with no consumer; dead-letters expired messages back to [`WORK_EXCHANGE`]
pub const RETRY_QUEUE: &str = "retry.queue";
