//! # Pub/sub seams
//!
//! Two roles are modelled here:
//!
//! - [`FanoutBus`]: the fan-out layer between the bridge and the delivery engine. Topics are
//!   exact (`chat.{conversation_id}.tokens`) and consumers register a callback per topic.
//! - [`TokenSource`] / [`SourcePublisher`]: the durable source the origin publishes to and the
//!   bridge drains through a wildcard pattern.
//!
//! Production adapters speak NATS ([`nats_bus`]) and Redis ([`redis_source`]); [`memory`] provides
//! in-process equivalents selected with `memory://` URLs.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use shared::config::server::{BusConfig, SourceConfig};
use std::sync::Arc;
use thiserror::Error;

/// In-process adapters for tests and `memory://` URLs.
pub mod memory;
/// NATS fan-out adapter.
pub mod nats_bus;
/// Redis source adapter.
pub mod redis_source;

pub use memory::{MemoryBus, MemorySource};

/// Scheme selecting the in-process adapters.
pub const MEMORY_SCHEME: &str = "memory://";

/// Callback invoked for every message delivered on a subscribed topic.
///
/// Handlers run on the bus client's delivery path and must never block.
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A message received from the durable source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    /// Concrete channel the message was published on.
    pub channel: String,
    /// Raw message body.
    pub payload: Bytes,
}

/// Stream of messages matching a source pattern, in delivery order.
pub type SourceStream = BoxStream<'static, SourceMessage>;

/// Failures of a bus or source adapter.
#[derive(Debug, Error)]
pub enum BusError {
    /// The initial connection could not be made.
    #[error("failed to connect to {target}: {reason}")]
    Connect {
        /// `nats` or `redis`.
        target: &'static str,
        /// Client error text.
        reason: String,
    },
    /// The server refused or failed the subscription.
    #[error("failed to subscribe to '{topic}': {reason}")]
    Subscribe {
        /// Topic or pattern.
        topic: String,
        /// Client error text.
        reason: String,
    },
    /// The message could not be handed to the server.
    #[error("failed to publish to '{topic}': {reason}")]
    Publish {
        /// Topic or channel.
        topic: String,
        /// Client error text.
        reason: String,
    },
    /// No adapter handles the url scheme.
    #[error("unsupported url '{0}'")]
    UnsupportedUrl(String),
}

/// Fan-out bus shared by every connection of a process.
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Publishes `payload` on an exact topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;

    /// Registers `handler` for `topic`. Delivery stops once the returned handle is
    /// unsubscribed or dropped.
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError>;

    /// Whether the client currently holds a live connection.
    fn is_connected(&self) -> bool;
}

/// Live registration on a [`FanoutBus`] topic.
#[async_trait]
pub trait BusSubscription: Send {
    /// Stops delivery. Calling it more than once is a no-op.
    async fn unsubscribe(&mut self);
}

/// Wildcard subscription over the durable source.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Subscribes to `pattern` and resolves once the source confirmed the subscription.
    async fn psubscribe(&self, pattern: &str) -> Result<SourceStream, BusError>;
}

/// Publishing side of the durable source.
#[async_trait]
pub trait SourcePublisher: Send + Sync {
    /// Publishes `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;
}

/// Connects the fan-out bus named by `config.url`.
///
/// # Errors
/// Returns [`BusError`] when the scheme is unknown or the connection fails.
pub async fn connect_bus(config: &BusConfig) -> Result<Arc<dyn FanoutBus>, BusError> {
    if config.url.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(MemoryBus::default()));
    }
    if config.url.starts_with("nats://") || config.url.starts_with("tls://") {
        return Ok(Arc::new(nats_bus::NatsBus::connect(config).await?));
    }
    Err(BusError::UnsupportedUrl(config.url.clone()))
}

/// Opens the durable source for draining.
///
/// # Errors
/// Returns [`BusError`] when the scheme is unknown or the client cannot be created.
pub fn open_source(config: &SourceConfig) -> Result<Arc<dyn TokenSource>, BusError> {
    if config.url.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(MemorySource::default()));
    }
    if config.url.starts_with("redis://") || config.url.starts_with("rediss://") {
        return Ok(Arc::new(redis_source::RedisSource::open(&config.url)?));
    }
    Err(BusError::UnsupportedUrl(config.url.clone()))
}

/// Connects the publishing side of the durable source.
///
/// # Errors
/// Returns [`BusError`] when the scheme is unknown or the connection fails.
pub async fn connect_publisher(
    config: &SourceConfig,
) -> Result<Arc<dyn SourcePublisher>, BusError> {
    if config.url.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(MemorySource::default()));
    }
    if config.url.starts_with("redis://") || config.url.starts_with("rediss://") {
        return Ok(Arc::new(redis_source::RedisPublisher::connect(&config.url).await?));
    }
    Err(BusError::UnsupportedUrl(config.url.clone()))
}
