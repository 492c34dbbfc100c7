//! Default adapters behind the capability interfaces.
//!
//! The engine only depends on the traits in [`services`](crate::services);
//! these adapters are what the worker binary wires in:
//!
//! - [`RconClient`]: game-server commands over the RCON TCP protocol
//! - [`RedisCache`]: statistics cache on Redis
//! - [`RelayMailer`]: templated mail through an HTTP mail-relay service
//! - [`HttpApplicationStore`]: document updates through the gatekeeping
//!   API service's internal endpoint

pub mod mailer;
pub mod rcon;
pub mod redis_cache;
pub mod store;

pub use mailer::RelayMailer;
pub use rcon::RconClient;
pub use redis_cache::RedisCache;
pub use store::HttpApplicationStore;
