use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::crypto::hash_hex;

/// Hashes remembered per topic before the oldest are evicted.
pub const MESSAGES_PER_TOPIC: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(n) => n,
    None => panic!("zero capacity"),
};

/// Hashes of messages already seen, per topic.
///
/// Each topic keeps only its most recent hashes. Kept in memory only:
/// after a restart or an eviction the history store catches replays.
#[derive(Debug)]
pub struct MessageCache {
    seen: HashMap<String, LruCache<String, ()>>,
    per_topic: NonZeroUsize,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::with_capacity(MESSAGES_PER_TOPIC)
    }
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(per_topic: NonZeroUsize) -> Self {
        Self {
            seen: HashMap::new(),
            per_topic,
        }
    }

    /// Record `message`. Returns its hash.
    pub fn set(&mut self, topic: &str, message: &str) -> String {
        let hash = hash_hex(message.as_bytes());
        let per_topic = self.per_topic;
        self.seen
            .entry(topic.to_string())
            .or_insert_with(|| LruCache::new(per_topic))
            .put(hash.clone(), ());
        hash
    }

    pub fn has(&self, topic: &str, message: &str) -> bool {
        self.seen
            .get(topic)
            .is_some_and(|hashes| hashes.contains(&hash_hex(message.as_bytes())))
    }

    pub fn del(&mut self, topic: &str) {
        self.seen.remove(topic);
    }

    pub fn topics(&self) -> usize {
        self.seen.len()
    }

    /// Hashes held for `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.seen.get(topic).map_or(0, LruCache::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_is_per_topic() {
        let mut cache = MessageCache::new();
        cache.set("a", "payload");
        assert!(cache.has("a", "payload"));
        assert!(!cache.has("b", "payload"));
        assert!(!cache.has("a", "other"));

        cache.del("a");
        assert!(!cache.has("a", "payload"));
        assert_eq!(cache.topics(), 0);
    }

    #[test]
    fn each_topic_keeps_only_recent_hashes() {
        let mut cache = MessageCache::with_capacity(NonZeroUsize::new(3).unwrap());
        for n in 0..10 {
            cache.set("a", &format!("message {n}"));
        }
        cache.set("b", "message 0");

        assert_eq!(cache.len("a"), 3);
        assert!(!cache.has("a", "message 6"));
        assert!(cache.has("a", "message 7"));
        assert!(cache.has("a", "message 9"));
        assert!(cache.has("b", "message 0"));
    }

    #[test]
    fn default_bound_holds_under_a_long_session() {
        let mut cache = MessageCache::new();
        for n in 0..(MESSAGES_PER_TOPIC.get() * 2) {
            cache.set("session", &n.to_string());
        }
        assert_eq!(cache.len("session"), MESSAGES_PER_TOPIC.get());
    }
}
