use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use std::fmt;
use tracing::info;

use super::{BusError, SourceMessage, SourcePublisher, SourceStream, TokenSource};

fn connect_error(err: &redis::RedisError) -> BusError {
    BusError::Connect {
        target: "redis",
        reason: err.to_string(),
    }
}

/// Redis pub/sub as the durable source drained by the bridge.
pub struct RedisSource {
    client: redis::Client,
}

impl fmt::Debug for RedisSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSource").finish_non_exhaustive()
    }
}

impl RedisSource {
    /// Validates `url` and prepares a client; no connection is made yet.
    ///
    /// # Errors
    /// Returns [`BusError::Connect`] when the url cannot be parsed.
    pub fn open(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|err| connect_error(&err))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TokenSource for RedisSource {
    async fn psubscribe(&self, pattern: &str) -> Result<SourceStream, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| connect_error(&err))?;

        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|err| BusError::Subscribe {
                topic: pattern.to_string(),
                reason: err.to_string(),
            })?;
        info!(pattern, "Subscribed to Redis pattern");

        let stream = pubsub.into_on_message().map(|message| SourceMessage {
            channel: message.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(message.get_payload_bytes()),
        });
        Ok(stream.boxed())
    }
}

/// Publishing handle used by the origin stream proxy.
#[derive(Clone)]
pub struct RedisPublisher {
    connection: MultiplexedConnection,
}

impl fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisPublisher").finish_non_exhaustive()
    }
}

impl RedisPublisher {
    /// Opens a multiplexed connection to `url`.
    ///
    /// # Errors
    /// Returns [`BusError::Connect`] when the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|err| connect_error(&err))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| connect_error(&err))?;
        info!("Connected to Redis");
        Ok(Self { connection })
    }
}

#[async_trait]
impl SourcePublisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        connection
            .publish::<_, _, i64>(channel, payload.to_vec())
            .await
            .map(|_receivers| ())
            .map_err(|err| BusError::Publish {
                topic: channel.to_string(),
                reason: err.to_string(),
            })
    }
}
