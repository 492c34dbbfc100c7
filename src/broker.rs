//! RabbitMQ session: topology, consumption, and the retry publish path.
//!
//! The session owns one connection and one channel and declares the
//! work/retry topology on connect:
//!
//! - `work.ex` (fanout, durable) fans into `work.queue`
//! - `work.queue` (durable) dead-letters expired messages to `retry.ex` and
//!   carries a 24-hour message TTL
//! - `retry.ex` (fanout, durable) fans into `retry.queue`
//! - `retry.queue` (durable) has no consumer and dead-letters expired
//!   messages back to `work.ex`
//!
//! Publishing to `retry.ex` with a per-message expiration therefore parks the
//! message until the delay elapses and then feeds it back to the work queue.
//!
//! Prefetch is 1: the engine holds at most one unacknowledged delivery, which
//! serializes handler side effects per task.

use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{RETRY_EXCHANGE, RETRY_QUEUE, WORK_EXCHANGE, WORK_QUEUE};

/// Default TTL on the work queue: 24 hours. A task nobody acknowledged (the
/// quorum-miss path) is eventually dead-lettered through the retry exchange
/// and redelivered.
const WORK_QUEUE_TTL_MS: i32 = 86_400_000;

/// Errors from the broker session.
///
/// During startup these are fatal; at runtime a dead connection surfaces
/// through the close-event receiver instead.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to RabbitMQ: {0}")]
    Connect(#[source] lapin::Error),

    #[error("failed to open a channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare {entity}: {source}")]
    Declare {
        entity: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to register a consumer: {0}")]
    Consume(#[source] lapin::Error),

    #[error("failed to publish retry message: {0}")]
    Publish(#[source] lapin::Error),

    #[error("failed to acknowledge delivery: {0}")]
    Ack(#[source] lapin::Error),
}

/// An established broker session.
///
/// Dropping the session drops the connection; the reconnect supervisor builds
/// a replacement through [`BrokerSession::connect`].
pub struct BrokerSession {
    connection: Connection,
    channel: Channel,
}

impl BrokerSession {
    /// Dial the broker, declare the topology, and arm the close-event
    /// channel.
    ///
    /// Returns the session together with a receiver that yields at most one
    /// asynchronous connection error; a value there means the connection is
    /// dead and the session must be rebuilt.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::Receiver<lapin::Error>), BrokerError> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name("gatekeeper-worker".into()),
        )
        .await
        .map_err(BrokerError::Connect)?;

        let (close_tx, close_rx) = mpsc::channel(1);
        connection.on_error(move |err| {
            let _ = close_tx.try_send(err);
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::Channel)?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|source| BrokerError::Declare {
                entity: "channel prefetch",
                source,
            })?;

        declare_topology(&channel).await?;

        Ok((Self { connection, channel }, close_rx))
    }

    /// Start consuming `work.queue` with manual acknowledgement.
    pub async fn consume(&self, consumer_tag: &str) -> Result<Consumer, BrokerError> {
        self.channel
            .basic_consume(
                WORK_QUEUE,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Consume)
    }

    /// Publish a message to the retry exchange with a per-message expiration.
    ///
    /// The message is durable, typed `application/json`, and carries the
    /// caller's headers (the incremented retry counter). The empty routing
    /// key is enough for a fanout exchange.
    pub async fn publish_retry(
        &self,
        headers: FieldTable,
        body: &[u8],
        expiration_ms: u64,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_expiration(expiration_ms.to_string().into())
            .with_headers(headers);

        let confirm = self
            .channel
            .basic_publish(
                RETRY_EXCHANGE,
                "",
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(BrokerError::Publish)?;

        confirm.await.map_err(BrokerError::Publish)?;
        Ok(())
    }

    /// Positively acknowledge one delivery.
    pub async fn ack(&self, delivery: &lapin::message::Delivery) -> Result<(), BrokerError> {
        delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(BrokerError::Ack)
    }

    /// Close channel and connection for a clean shutdown.
    ///
    /// Anything delivered but not yet acknowledged is redelivered by the
    /// broker after the next connect.
    pub async fn close(self) {
        if let Err(err) = self.channel.close(200, "worker shutting down").await {
            debug!(error = %err, "Channel close failed");
        }
        if let Err(err) = self.connection.close(200, "worker shutting down").await {
            debug!(error = %err, "Connection close failed");
        }
    }
}

async fn declare_topology(channel: &Channel) -> Result<(), BrokerError> {
    fn durable_exchange() -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        }
    }
    fn durable_queue() -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: true,
            ..Default::default()
        }
    }

    channel
        .exchange_declare(
            WORK_EXCHANGE,
            ExchangeKind::Fanout,
            durable_exchange(),
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::Declare {
            entity: "work exchange",
            source,
        })?;

    channel
        .exchange_declare(
            RETRY_EXCHANGE,
            ExchangeKind::Fanout,
            durable_exchange(),
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::Declare {
            entity: "retry exchange",
            source,
        })?;

    let mut work_args = FieldTable::default();
    work_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(RETRY_EXCHANGE.into()),
    );
    work_args.insert("x-message-ttl".into(), AMQPValue::LongInt(WORK_QUEUE_TTL_MS));

    channel
        .queue_declare(WORK_QUEUE, durable_queue(), work_args)
        .await
        .map_err(|source| BrokerError::Declare {
            entity: "work queue",
            source,
        })?;

    // Expired retries go straight back to the work exchange; nothing ever
    // consumes this queue.
    let mut retry_args = FieldTable::default();
    retry_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(WORK_EXCHANGE.into()),
    );

    channel
        .queue_declare(RETRY_QUEUE, durable_queue(), retry_args)
        .await
        .map_err(|source| BrokerError::Declare {
            entity: "retry queue",
            source,
        })?;

    channel
        .queue_bind(
            WORK_QUEUE,
            WORK_EXCHANGE,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::Declare {
            entity: "work queue binding",
            source,
        })?;

    channel
        .queue_bind(
            RETRY_QUEUE,
            RETRY_EXCHANGE,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::Declare {
            entity: "retry queue binding",
            source,
        })?;

    Ok(())
}
