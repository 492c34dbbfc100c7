//! Engine main loop, reconnect supervisor, and stats tick.
//!
//! The engine multiplexes three event sources on a single dispatch task: the
//! delivery stream from the work queue, the broker's close-event channel, and
//! the shutdown signal. Deliveries run their handler inline (prefetch is 1,
//! so one task is in flight at a time); a close event runs the reconnect
//! supervisor inline, which is fine because nothing is being delivered while
//! the connection is down.

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::Consumer;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{BrokerError, BrokerSession};
use crate::config::GatekeeperConfig;
use crate::dispatch::OpDispatcher;
use crate::handlers::{Disposition, Handlers};
use crate::retry;
use crate::services::{ApplicationStore, Cache, GameRpc, Mailer};
use crate::shutdown::ShutdownSignal;
use crate::task::{Status, Task};

/// Dial attempts after an unexpected close before giving up for good.
const RECONNECT_ATTEMPTS: u32 = 3;

/// Pause between reconnect attempts.
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// Cadence of the aggregate-stats recomputation.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Capability bundle the engine is constructed with.
///
/// `game_rpc` is absent in the test environment; a task that needs it then
/// fails into the normal retry path instead of touching a live server.
pub struct Services {
    pub store: Arc<dyn ApplicationStore>,
    pub cache: Arc<dyn Cache>,
    pub mailer: Arc<dyn Mailer>,
    pub game_rpc: Option<Arc<dyn GameRpc>>,
}

/// Fatal engine errors. Anything here terminates the worker.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("unable to reconnect to the message broker after {attempts} attempts: {source}")]
    ReconnectFailed {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

/// The task-execution engine.
pub struct Engine {
    config: Arc<GatekeeperConfig>,
    handlers: Handlers,
    cache: Arc<dyn Cache>,
    shutdown: ShutdownSignal,
    consumer_tag: String,
}

impl Engine {
    pub fn new(
        config: Arc<GatekeeperConfig>,
        services: Services,
        shutdown: ShutdownSignal,
    ) -> Self {
        let dispatcher = OpDispatcher::new(
            config.dispatch.strategy,
            config.dispatch.ops.clone(),
            config.dispatch.random_threshold,
        );
        let handlers = Handlers::new(
            config.clone(),
            dispatcher,
            services.store,
            services.cache.clone(),
            services.mailer,
            services.game_rpc,
        );

        Self {
            config,
            handlers,
            cache: services.cache,
            shutdown,
            consumer_tag: consumer_tag(),
        }
    }

    /// Run until shutdown or a fatal error.
    ///
    /// Establishing the first session is startup: any broker failure here is
    /// fatal. Afterwards the loop survives broker closes through the
    /// reconnect supervisor; only reconnect exhaustion ends it early.
    pub async fn run(self) -> Result<(), EngineError> {
        let (mut session, mut close_rx) =
            BrokerSession::connect(&self.config.rabbitmq_url).await?;
        let mut consumer = session.consume(&self.consumer_tag).await?;

        let stats = spawn_stats_tick(self.cache.clone(), self.shutdown.clone());
        let mut shutdown_rx = self.shutdown.subscribe();

        info!(consumer_tag = %self.consumer_tag, "Worker started. Listening for messages");

        let outcome = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping the dispatch loop");
                    break Ok(());
                }

                Some(err) = close_rx.recv() => {
                    warn!(
                        error = %err,
                        "Connection with the message broker closed unexpectedly. About to reconnect"
                    );
                    match self.reconnect().await {
                        Ok(connected) => (session, consumer, close_rx) = connected,
                        Err(err) => break Err(err),
                    }
                }

                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => self.process_delivery(&session, delivery).await,
                    Some(Err(err)) => warn!(error = %err, "Delivery stream error"),
                    None => {
                        // The stream only ends when the channel died; wait for
                        // the close notification instead of spinning.
                        warn!("Delivery stream ended, waiting for the close event");
                        match close_rx.recv().await {
                            Some(err) => {
                                warn!(
                                    error = %err,
                                    "Connection with the message broker closed unexpectedly. About to reconnect"
                                );
                                match self.reconnect().await {
                                    Ok(connected) => (session, consumer, close_rx) = connected,
                                    Err(err) => break Err(err),
                                }
                            }
                            None => break Ok(()),
                        }
                    }
                }
            }
        };

        stats.abort();
        session.close().await;
        outcome
    }

    /// Decode a delivery, run its handler, and execute the disposition.
    async fn process_delivery(&self, session: &BrokerSession, delivery: Delivery) {
        if delivery.data.is_empty() {
            // Left unacknowledged; the work queue TTL will cycle it back
            warn!("Skipping delivery with an empty body");
            return;
        }

        let task = match Task::decode(&delivery.data) {
            Ok(task) => task,
            Err(err) => {
                error!(
                    error = %err,
                    body_len = delivery.data.len(),
                    "Unable to decode message into a task; dropping it"
                );
                self.ack(session, &delivery).await;
                return;
            }
        };

        let headers = delivery.properties.headers().as_ref();
        let disposition = match task.status {
            Status::Pending => self.handlers.process_new_request(&task).await,
            Status::Approved => self.handlers.process_approval(&task, headers).await,
            Status::Denied => self.handlers.process_denial(&task).await,
            Status::Deactivated => self.handlers.process_deactivate(&task, headers).await,
            Status::Banned => self.handlers.process_ban(&task, headers).await,
            Status::Unknown => {
                warn!(
                    id = %task.id,
                    "Task carries an unrecognized status; acknowledging without action"
                );
                Disposition::Ack
            }
        };

        match disposition {
            Disposition::Ack => self.ack(session, &delivery).await,
            Disposition::Retry {
                delay_ms,
                retry_count,
            } => {
                let headers = retry::retry_headers(retry_count);
                match session.publish_retry(headers, &delivery.data, delay_ms).await {
                    // Republish first, then ack: a crash in between means
                    // redelivery, never loss.
                    Ok(()) => self.ack(session, &delivery).await,
                    Err(err) => error!(
                        error = %err,
                        "Unable to republish message for retry; leaving the delivery unacknowledged"
                    ),
                }
            }
            Disposition::Leave => {}
        }
    }

    async fn ack(&self, session: &BrokerSession, delivery: &Delivery) {
        if let Err(err) = session.ack(delivery).await {
            error!(error = %err, "Failed to acknowledge delivery");
        }
    }

    /// Rebuild the session after an unexpected close.
    ///
    /// Up to [`RECONNECT_ATTEMPTS`] dials with [`RECONNECT_PAUSE`] between
    /// them; exhaustion is fatal. Deliveries that were in flight when the
    /// connection died are redelivered by the broker once we are back.
    async fn reconnect(
        &self,
    ) -> Result<(BrokerSession, Consumer, mpsc::Receiver<lapin::Error>), EngineError> {
        let mut attempt = 1;
        loop {
            if attempt > 1 {
                info!(attempt, max = RECONNECT_ATTEMPTS, "Trying to reconnect to the message broker");
            }

            match self.try_connect().await {
                Ok(connected) => {
                    info!("Broker connection re-established. Continuing to process messages");
                    return Ok(connected);
                }
                Err(source) if attempt >= RECONNECT_ATTEMPTS => {
                    return Err(EngineError::ReconnectFailed {
                        attempts: RECONNECT_ATTEMPTS,
                        source,
                    });
                }
                Err(err) => {
                    warn!(error = %err, attempt, "Reconnect attempt failed");
                    attempt += 1;
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }

    async fn try_connect(
        &self,
    ) -> Result<(BrokerSession, Consumer, mpsc::Receiver<lapin::Error>), BrokerError> {
        let (session, close_rx) = BrokerSession::connect(&self.config.rabbitmq_url).await?;
        let consumer = session.consume(&self.consumer_tag).await?;
        Ok((session, consumer, close_rx))
    }
}

/// Background task recomputing aggregate stats every [`STATS_INTERVAL`].
///
/// Each tick spawns its own short-lived task so a slow recomputation never
/// delays the next tick; ticks may therefore overlap each other but never
/// block the dispatch loop.
fn spawn_stats_tick(cache: Arc<dyn Cache>, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        let start = tokio::time::Instant::now() + STATS_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, STATS_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let cache = cache.clone();
                    tokio::spawn(async move {
                        match cache.update_aggregate_stats().await {
                            Ok(()) => info!("Aggregate stats recomputed"),
                            Err(err) => error!(error = %err, "Unable to aggregate stats"),
                        }
                    });
                }
            }
        }
    })
}

/// Consumer tag for this worker instance, derived from the hostname with a
/// UUID fallback.
fn consumer_tag() -> String {
    if let Ok(host) = hostname::get() {
        if let Some(host) = host.to_str() {
            return format!("gatekeeper-{host}");
        }
    }
    format!("gatekeeper-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingCache;

    #[test]
    fn consumer_tag_is_namespaced() {
        assert!(consumer_tag().starts_with("gatekeeper-"));
    }

    /// Let the ticker task and the per-tick job it spawns both get polled.
    async fn drain_spawned() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stats_tick_fires_after_each_interval() {
        let cache = Arc::new(RecordingCache::default());
        let shutdown = ShutdownSignal::new();
        let handle = spawn_stats_tick(cache.clone(), shutdown.clone());

        tokio::time::sleep(STATS_INTERVAL + Duration::from_millis(50)).await;
        drain_spawned().await;
        assert_eq!(cache.aggregate_calls(), 1);

        tokio::time::sleep(STATS_INTERVAL).await;
        drain_spawned().await;
        assert_eq!(cache.aggregate_calls(), 2);

        shutdown.trigger();
        handle.abort();
    }
}
