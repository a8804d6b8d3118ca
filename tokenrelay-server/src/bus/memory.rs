use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    BusError, BusSubscription, FanoutBus, MessageHandler, SourceMessage, SourcePublisher,
    SourceStream, TokenSource,
};

type TopicTable = HashMap<String, Vec<(u64, MessageHandler)>>;

struct BusInner {
    next_id: AtomicU64,
    topics: RwLock<TopicTable>,
    connected: AtomicBool,
}

impl BusInner {
    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(handlers) = topics.get_mut(topic) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
            if handlers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// In-process fan-out bus.
///
/// `publish` invokes every handler registered on the topic synchronously, in
/// registration order, before returning.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                topics: RwLock::new(HashMap::new()),
                connected: AtomicBool::new(true),
            }),
        }
    }
}

impl fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBus")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MemoryBus {
    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Simulates the bus connection going down or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl FanoutBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                reason: "bus disconnected".into(),
            });
        }

        let handlers: Vec<MessageHandler> = self
            .inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        if !self.is_connected() {
            return Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: "bus disconnected".into(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));

        Ok(Box::new(MemorySubscription {
            id,
            topic: topic.to_string(),
            inner: Some(Arc::clone(&self.inner)),
        }))
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

struct MemorySubscription {
    id: u64,
    topic: String,
    inner: Option<Arc<BusInner>>,
}

impl MemorySubscription {
    fn release(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.remove(&self.topic, self.id);
        }
    }
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn unsubscribe(&mut self) {
        self.release();
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// In-process durable source with Redis-style glob patterns.
#[derive(Clone, Default)]
pub struct MemorySource {
    subscribers: Arc<RwLock<Vec<(String, mpsc::UnboundedSender<SourceMessage>)>>>,
    refuse_subscriptions: Arc<AtomicBool>,
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource").finish_non_exhaustive()
    }
}

impl MemorySource {
    /// Makes every later `psubscribe` fail, as an unreachable source would.
    pub fn refuse_subscriptions(&self) {
        self.refuse_subscriptions.store(true, Ordering::SeqCst);
    }

    /// Number of open pattern streams.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Closes every open pattern stream.
    pub fn close_all(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl TokenSource for MemorySource {
    async fn psubscribe(&self, pattern: &str) -> Result<SourceStream, BusError> {
        if self.refuse_subscriptions.load(Ordering::SeqCst) {
            return Err(BusError::Subscribe {
                topic: pattern.to_string(),
                reason: "source unavailable".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pattern.to_string(), tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[async_trait]
impl SourcePublisher for MemorySource {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(pattern, tx)| {
            if !glob_match(pattern, channel) {
                return !tx.is_closed();
            }
            tx.send(SourceMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            })
            .is_ok()
        });
        Ok(())
    }
}

/// Redis `PSUBSCRIBE` glob matching for `*` and `?`.
fn glob_match(pattern: &str, subject: &str) -> bool {
    let pattern = pattern.as_bytes();
    let subject = subject.as_bytes();
    let (mut p, mut s) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while s < subject.len() {
        match pattern.get(p) {
            Some(&b'*') => {
                backtrack = Some((p, s));
                p += 1;
            }
            Some(&c) if c == b'?' || c == subject[s] => {
                p += 1;
                s += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    s = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio_stream::StreamExt;

    fn recording_handler() -> (MessageHandler, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |payload: Bytes| sink.lock().unwrap().push(payload));
        (handler, seen)
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_the_topic() {
        let bus = MemoryBus::default();
        let (first, first_seen) = recording_handler();
        let (second, second_seen) = recording_handler();
        let (other, other_seen) = recording_handler();

        let _a = bus.subscribe("chat.c1.tokens", first).await.unwrap();
        let _b = bus.subscribe("chat.c1.tokens", second).await.unwrap();
        let _c = bus.subscribe("chat.c2.tokens", other).await.unwrap();

        bus.publish("chat.c1.tokens", Bytes::from_static(b"one"))
            .await
            .unwrap();

        assert_eq!(first_seen.lock().unwrap().len(), 1);
        assert_eq!(second_seen.lock().unwrap().len(), 1);
        assert!(other_seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let bus = MemoryBus::default();
        let (handler, seen) = recording_handler();
        let mut subscription = bus.subscribe("t", handler).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 1);

        subscription.unsubscribe().await;
        subscription.unsubscribe().await;
        assert_eq!(bus.subscriber_count("t"), 0);

        bus.publish("t", Bytes::from_static(b"late")).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_handle_unsubscribes() {
        let bus = MemoryBus::default();
        let (handler, _) = recording_handler();
        let subscription = bus.subscribe("t", handler).await.unwrap();
        drop(subscription);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn disconnected_bus_refuses_work() {
        let bus = MemoryBus::default();
        bus.set_connected(false);
        let (handler, _) = recording_handler();

        assert!(bus.subscribe("t", handler).await.is_err());
        assert!(bus.publish("t", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn source_routes_by_pattern() {
        let source = MemorySource::default();
        let tokens = source.psubscribe("llm:tokens:*").await.unwrap();

        source
            .publish("llm:tokens:c1", Bytes::from_static(b"a"))
            .await
            .unwrap();
        source
            .publish("other:c1", Bytes::from_static(b"b"))
            .await
            .unwrap();
        source.close_all();

        let received: Vec<SourceMessage> = tokens.collect().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].channel, "llm:tokens:c1");
    }

    #[tokio::test]
    async fn refused_source_fails_psubscribe() {
        let source = MemorySource::default();
        source.refuse_subscriptions();
        assert!(source.psubscribe("*").await.is_err());
    }

    #[test]
    fn glob_semantics() {
        assert!(glob_match("llm:tokens:*", "llm:tokens:abc"));
        assert!(glob_match("llm:tokens:*", "llm:tokens:"));
        assert!(glob_match("chat.*.tokens", "chat.c1.tokens"));
        assert!(glob_match("c?", "c1"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("llm:tokens:*", "llm:other:abc"));
        assert!(!glob_match("c?", "c12"));
    }
}
