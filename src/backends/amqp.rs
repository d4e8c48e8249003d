//! AMQP (RabbitMQ) transport for Celery apps.
//!
//! Declared depth comes from a passive `queue.declare`, which reports the
//! message count without creating anything. A queue the broker does not know
//! answers with a 404 channel close, reported as [`BackendError::NotFound`].
//!
//! Worker inspection speaks Celery's pidbox protocol: a command is published
//! on the `celery.pidbox` fanout exchange, every worker answers on
//! `reply.celery.pidbox` with the ticket as routing key, and replies are
//! gathered until the reply timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backends::redis::redacted;
use crate::backends::{InspectMethod, QueueDepth, WorkerControl};
use crate::error::{BackendError, ConfigError};

pub const PIDBOX_EXCHANGE: &str = "celery.pidbox";
pub const REPLY_EXCHANGE: &str = "reply.celery.pidbox";

/// How long an inspection waits for worker replies, as Celery's `inspect()`.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether a URL selects the AMQP transport.
pub fn is_amqp_url(url: &str) -> bool {
    url.starts_with("amqp://") || url.starts_with("amqps://")
}

/// A Celery app reached over AMQP: queue depth and worker control share one
/// connection, established on first use and re-established once it drops.
pub struct AmqpBroker {
    url: String,
    identity: String,
    reply_timeout: Duration,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("url", &self.identity)
            .field("reply_timeout", &self.reply_timeout)
            .finish()
    }
}

impl AmqpBroker {
    /// Validates the URL without connecting.
    pub fn open(url: &str) -> Result<Self, ConfigError> {
        url.parse::<AMQPUri>().map_err(|reason| ConfigError::InvalidUrl {
            url: redacted(url),
            reason,
        })?;
        Ok(Self {
            url: url.to_string(),
            identity: redacted(url),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            connection: Mutex::new(None),
        })
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    async fn channel(&self) -> Result<Channel, BackendError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref().filter(|c| c.status().connected()) {
            return Ok(conn.create_channel().await?);
        }

        debug!(url = %self.identity, "Connecting to AMQP broker");
        let conn = Connection::connect(
            &self.url,
            ConnectionProperties::default().with_connection_name("hirefire".into()),
        )
        .await
        .map_err(|e| BackendError::Unavailable(format!("{}: {e}", self.identity)))?;
        let conn = Arc::new(conn);
        *slot = Some(conn.clone());
        Ok(conn.create_channel().await?)
    }

    async fn broadcast(&self, channel: &Channel, method: InspectMethod) -> Result<Value, BackendError> {
        let ticket = Uuid::new_v4().to_string();
        let reply_queue = format!("{ticket}.{REPLY_EXCHANGE}");

        channel
            .exchange_declare(PIDBOX_EXCHANGE, ExchangeKind::Fanout, transient(), FieldTable::default())
            .await?;
        channel
            .exchange_declare(REPLY_EXCHANGE, ExchangeKind::Direct, transient(), FieldTable::default())
            .await?;
        channel
            .queue_declare(
                &reply_queue,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(&reply_queue, REPLY_EXCHANGE, &ticket, QueueBindOptions::default(), FieldTable::default())
            .await?;
        let mut consumer = channel
            .basic_consume(
                &reply_queue,
                &format!("hirefire-{ticket}"),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let body = serde_json::to_vec(&control_request(method, &ticket))
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        channel
            .basic_publish(
                PIDBOX_EXCHANGE,
                "",
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_content_encoding("utf-8".into()),
            )
            .await?
            .await?;

        let mut replies = Map::new();
        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        loop {
            match tokio::time::timeout_at(deadline, consumer.next()).await {
                Ok(Some(delivery)) => merge_reply(&mut replies, &delivery?.data)?,
                Ok(None) | Err(_) => break,
            }
        }
        debug!(method = %method, workers = replies.len(), "Collected worker replies");

        Ok(if replies.is_empty() {
            Value::Null
        } else {
            Value::Object(replies)
        })
    }
}

#[async_trait]
impl QueueDepth for AmqpBroker {
    async fn declared_depth(&self, queue: &str) -> Result<u64, BackendError> {
        // A 404 closes the channel, so each check gets its own.
        let channel = self.channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match declared {
            Ok(state) => {
                close(&channel).await;
                Ok(u64::from(state.message_count()))
            }
            Err(e) if is_not_found(&e.to_string()) => Err(BackendError::NotFound {
                queue: queue.to_string(),
            }),
            Err(e) => {
                close(&channel).await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl WorkerControl for AmqpBroker {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn inspect(&self, method: InspectMethod) -> Result<Value, BackendError> {
        let channel = self.channel().await?;
        let result = self.broadcast(&channel, method).await;
        close(&channel).await;
        result
    }
}

async fn close(channel: &Channel) {
    if channel.status().connected() {
        if let Err(e) = channel.close(200, "OK").await {
            warn!(error = %e, "Failed to close AMQP channel");
        }
    }
}

/// Celery declares both pidbox exchanges non-durable.
fn transient() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: false,
        auto_delete: false,
        ..Default::default()
    }
}

/// Broker replies that mean the queue does not exist.
fn is_not_found(reply: &str) -> bool {
    reply.contains("NOT_FOUND") || reply.contains("404")
}

/// A pidbox command addressed to every worker.
fn control_request(method: InspectMethod, ticket: &str) -> Value {
    json!({
        "method": method.as_str(),
        "arguments": {},
        "destination": null,
        "pattern": null,
        "matcher": null,
        "ticket": ticket,
        "reply_to": {"exchange": REPLY_EXCHANGE, "routing_key": ticket},
    })
}

/// Folds one `{hostname: reply}` message into the collected replies.
fn merge_reply(replies: &mut Map<String, Value>, body: &[u8]) -> Result<(), BackendError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| BackendError::Malformed(e.to_string()))?;
    match value {
        Value::Object(reply) => {
            replies.extend(reply);
            Ok(())
        }
        other => Err(BackendError::Malformed(format!(
            "worker reply must be an object keyed by hostname, got {other}"
        ))),
    }
}
