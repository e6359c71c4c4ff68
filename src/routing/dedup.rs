//! Recently seen message ids
//!
//! Flooding delivers the same message to a router over several paths. The
//! message cache remembers each id for one TTL so every copy after the first
//! is dropped.

use crate::api::config::CacheConfig;
use crate::cache::{ExpiringTable, ExpiryHooks, Tick};

struct MessageHooks;

impl ExpiryHooks<String, ()> for MessageHooks {
    fn on_expire(&self, id: &String, _value: &()) {
        tracing::trace!(id = %id, "message id expired");
    }
}

/// Expiring set of message ids
pub struct MessageCache {
    table: ExpiringTable<String, (), MessageHooks>,
}

impl MessageCache {
    /// Create an empty cache
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_ttl(config.ttl_ticks, config.buckets)
    }

    /// Create an empty cache with explicit sizing
    pub fn with_ttl(ttl_ticks: u64, buckets: usize) -> Self {
        Self {
            table: ExpiringTable::new(ttl_ticks, buckets, MessageHooks),
        }
    }

    /// Record `id`, reporting whether it was already present
    ///
    /// Lookup and insertion happen under one lock, so of several concurrent
    /// callers with the same id exactly one sees `false`. A duplicate does not
    /// refresh the entry.
    pub fn seen(&self, id: &str) -> bool {
        if self.table.contains(id) {
            return true;
        }
        !self.table.insert_if_absent(id.to_string(), ())
    }

    /// Number of ids currently remembered
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Forget everything
    pub fn clear(&self) {
        self.table.clear();
    }
}

impl Tick for MessageCache {
    fn tick(&self) -> usize {
        self.table.tick()
    }

    fn label(&self) -> &'static str {
        "messages"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_seen_twice() {
        let cache = MessageCache::with_ttl(10, 16);
        assert!(!cache.seen("m1"));
        assert!(cache.seen("m1"));
        assert!(!cache.seen("m2"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_forgotten_after_ttl() {
        let cache = MessageCache::with_ttl(5, 16);
        assert!(!cache.seen("m1"));
        for _ in 0..4 {
            cache.tick();
            assert!(cache.seen("m1"));
        }
        cache.tick();
        assert!(!cache.seen("m1"));
    }

    #[test]
    fn test_duplicate_does_not_refresh() {
        let cache = MessageCache::with_ttl(3, 16);
        cache.seen("m1");
        cache.tick();
        cache.tick();
        assert!(cache.seen("m1"));
        cache.tick();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_exactly_one_first_sighting_under_contention() {
        let cache = Arc::new(MessageCache::with_ttl(100, 8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|i| !cache.seen(&format!("msg-{i}")))
                        .count()
                })
            })
            .collect();

        let first_sightings: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(first_sightings, 200);
    }
}
