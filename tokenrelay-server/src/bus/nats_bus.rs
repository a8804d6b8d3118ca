use async_nats::{ConnectOptions, Event, connection::State};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use shared::config::server::BusConfig;
use std::{fmt, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusError, BusSubscription, FanoutBus, MessageHandler};

/// Core NATS client used as the fan-out bus.
///
/// Publishes go to core NATS rather than JetStream so they propagate to leaf-node
/// subscribers. The client reconnects forever; health reflects the current state.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl fmt::Debug for NatsBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsBus")
            .field("state", &self.client.connection_state())
            .finish()
    }
}

impl NatsBus {
    /// Connects to the NATS server named by `config.url`.
    ///
    /// # Errors
    /// Returns [`BusError::Connect`] when the initial connection fails.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let reconnect_wait = Duration::from_millis(config.reconnect_wait_ms);

        let client = ConnectOptions::new()
            .name(config.client_name.clone())
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("NATS reconnected"),
                    Event::Disconnected => warn!("NATS disconnected"),
                    Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer"),
                    Event::ServerError(err) => error!(error = %err, "NATS server error"),
                    Event::ClientError(err) => error!(error = %err, "NATS client error"),
                    other => debug!(event = %other, "NATS event"),
                }
            })
            .connect(config.url.as_str())
            .await
            .map_err(|err| BusError::Connect {
                target: "nats",
                reason: err.to_string(),
            })?;

        info!(url = %config.url, "Connected to NATS");
        Ok(Self { client })
    }
}

#[async_trait]
impl FanoutBus for NatsBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|err| BusError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let mut subscriber =
            self.client
                .subscribe(topic.to_string())
                .await
                .map_err(|err| BusError::Subscribe {
                    topic: topic.to_string(),
                    reason: err.to_string(),
                })?;

        let token = CancellationToken::new();
        let stop = token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    message = subscriber.next() => match message {
                        Some(message) => handler(message.payload),
                        None => break,
                    },
                }
            }
            if let Err(err) = subscriber.unsubscribe().await {
                debug!(error = %err, "NATS unsubscribe failed");
            }
        });

        Ok(Box::new(NatsSubscription {
            token,
            task: Some(task),
        }))
    }

    fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }
}

struct NatsSubscription {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl BusSubscription for NatsSubscription {
    async fn unsubscribe(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                debug!(error = %err, "NATS subscription task ended abnormally");
            }
        }
    }
}

impl Drop for NatsSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
