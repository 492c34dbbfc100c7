//! Redis-backed statistics cache.
//!
//! The front-end reads three keys that this adapter maintains:
//!
//! - `gatekeeper:requests:all` — cached application listing. The engine only
//!   invalidates it; the API service repopulates it on the next read.
//! - `gatekeeper:stats:realtime` — hash of per-status counters, bumped as
//!   tasks flow through the engine.
//! - `gatekeeper:stats:aggregate` — JSON snapshot of the counters with a
//!   computed-at timestamp, rebuilt by the periodic stats tick.

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde_json::{json, Value};
use tracing::debug;

use crate::services::{Cache, CacheError};
use crate::task::Task;

/// Cached application listing maintained by the API service
pub const ALL_REQUESTS_KEY: &str = "gatekeeper:requests:all";

/// Hash of per-status counters
pub const REAL_TIME_STATS_KEY: &str = "gatekeeper:stats:realtime";

/// JSON snapshot of the aggregate statistics
pub const AGGREGATE_STATS_KEY: &str = "gatekeeper:stats:aggregate";

/// Statistics cache on a Redis connection pool.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|err| CacheError::Operation(format!("redis connection: {err}")))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn update_all_requests(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;

        // Invalidation only; the API service rebuilds the listing lazily
        let _: i64 = cmd("DEL")
            .arg(ALL_REQUESTS_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError::Operation(err.to_string()))?;

        debug!(key = ALL_REQUESTS_KEY, "Invalidated cached request listing");
        Ok(())
    }

    async fn update_real_time_stats(&self, task: &Task) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;

        let _: i64 = cmd("HINCRBY")
            .arg(REAL_TIME_STATS_KEY)
            .arg(status_field(task))
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError::Operation(err.to_string()))?;

        Ok(())
    }

    async fn update_aggregate_stats(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;

        let counters: Vec<(String, String)> = cmd("HGETALL")
            .arg(REAL_TIME_STATS_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError::Operation(err.to_string()))?;

        let snapshot = build_snapshot(&counters, chrono::Utc::now().to_rfc3339());
        let serialized = serde_json::to_string(&snapshot)
            .map_err(|err| CacheError::Operation(err.to_string()))?;

        let _: () = cmd("SET")
            .arg(AGGREGATE_STATS_KEY)
            .arg(serialized)
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError::Operation(err.to_string()))?;

        Ok(())
    }
}

/// Counter field for a task's status.
fn status_field(task: &Task) -> String {
    task.status.to_string().to_lowercase()
}

/// Fold raw counter pairs into the snapshot document.
fn build_snapshot(counters: &[(String, String)], computed_at: String) -> Value {
    let mut stats = serde_json::Map::new();
    let mut total: i64 = 0;
    for (field, value) in counters {
        let count = value.parse::<i64>().unwrap_or(0);
        total += count;
        stats.insert(field.clone(), json!(count));
    }

    json!({
        "counts": Value::Object(stats),
        "total": total,
        "computedAt": computed_at,
    })
}
