//! Inbound dedupe cache.
//!
//! Adapters redeliver on reconnect and webhook senders retry; the same
//! inbound identifier must produce a single Message. Bounded LRU —
//! 10 000 entries — keyed by (channel, message id).

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct DedupeCache {
    seen: Mutex<LruCache<String, ()>>,
}

impl DedupeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns `true` when this (channel, message id) was already seen.
    pub fn check_and_insert(&self, channel_id: &str, message_id: &str) -> bool {
        let key = format!("{channel_id}:{message_id}");
        let mut seen = self.seen.lock();
        if seen.contains(&key) {
            // Refresh recency so hot duplicates stay cached.
            seen.promote(&key);
            return true;
        }
        seen.put(key, ());
        false
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_detected() {
        let cache = DedupeCache::new(10);
        assert!(!cache.check_and_insert("chn_1", "m1"));
        assert!(cache.check_and_insert("chn_1", "m1"));
        // Same message id on another channel is distinct.
        assert!(!cache.check_and_insert("chn_2", "m1"));
    }

    #[test]
    fn lru_evicts_oldest_under_burst() {
        let cache = DedupeCache::new(3);
        for i in 0..4 {
            assert!(!cache.check_and_insert("c", &format!("m{i}")));
        }
        // m0 was evicted by the burst; it reads as new again.
        assert!(!cache.check_and_insert("c", "m0"));
        // m3 is still cached.
        assert!(cache.check_and_insert("c", "m3"));
    }
}
