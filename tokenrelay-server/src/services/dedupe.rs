use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

type Key = (String, u64);

/// Short-lived memory of `(conversation_id, sequence)` pairs already forwarded.
///
/// Local to one bridge instance; a zero window disables suppression.
#[derive(Debug)]
pub struct DedupeWindow {
    window: Duration,
    seen: HashMap<Key, Instant>,
    expiry: VecDeque<(Instant, Key)>,
}

impl DedupeWindow {
    /// A zero `window` disables suppression.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            expiry: VecDeque::new(),
        }
    }

    /// Whether the pair was recorded less than one window before `now`.
    pub fn contains(&mut self, conversation_id: &str, sequence: u64, now: Instant) -> bool {
        if self.window.is_zero() {
            return false;
        }
        self.evict(now);
        self.seen
            .contains_key(&(conversation_id.to_string(), sequence))
    }

    /// Remembers a forwarded envelope until `now + window`.
    pub fn record(&mut self, conversation_id: &str, sequence: u64, now: Instant) {
        if self.window.is_zero() {
            return;
        }
        let key = (conversation_id.to_string(), sequence);
        self.seen.insert(key.clone(), now);
        self.expiry.push_back((now, key));
        self.evict(now);
    }

    /// Number of remembered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no key is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((recorded, _)) = self.expiry.front() {
            if now.saturating_duration_since(*recorded) < self.window {
                break;
            }
            if let Some((recorded, key)) = self.expiry.pop_front() {
                // A later record of the same key refreshed it.
                if self.seen.get(&key) == Some(&recorded) {
                    self.seen.remove(&key);
                }
            }
        }
    }
}
