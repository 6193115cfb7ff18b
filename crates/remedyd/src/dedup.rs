//! Change-event deduplication (LRU with TTL).
//!
//! The push and poll paths can both deliver the same change; the router
//! asks here before dispatching.

use crate::change_feed::ChangeEvent;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const DEFAULT_CAPACITY: usize = 1000;

pub struct EventDeduplicator {
    cache: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
}

impl EventDeduplicator {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(DEFAULT_CAPACITY, ttl)
    }

    /// True if `key` was seen within the TTL; otherwise remembers it
    pub async fn check_and_insert(&self, key: &str) -> bool {
        let mut cache = self.cache.lock().await;
        let now = Instant::now();

        if let Some(seen) = cache.get(key) {
            if now.duration_since(*seen) < self.ttl {
                return true;
            }
            cache.pop(key);
        }
        cache.put(key.to_string(), now);
        false
    }

    pub async fn is_duplicate(&self, event: &ChangeEvent) -> bool {
        self.check_and_insert(&event.dedup_key()).await
    }

    /// Drop expired keys; called from the poll loop
    pub async fn prune_expired(&self) -> usize {
        let mut cache = self.cache.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_same_event_is_dropped_once_seen() {
        let dedup = EventDeduplicator::default();
        let event = ChangeEvent::TicketInserted {
            ticket_id: "t-1".into(),
            at: Utc::now(),
        };
        assert!(!dedup.is_duplicate(&event).await);
        assert!(dedup.is_duplicate(&event).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let dedup = EventDeduplicator::with_ttl(Duration::from_secs(60));
        assert!(!dedup.check_and_insert("k").await);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!dedup.check_and_insert("k").await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(dedup.prune_expired().await, 1);
        assert_eq!(dedup.len().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let dedup = EventDeduplicator::new(2, Duration::from_secs(60));
        dedup.check_and_insert("a").await;
        dedup.check_and_insert("b").await;
        dedup.check_and_insert("c").await;
        assert!(dedup.check_and_insert("c").await);
        assert!(!dedup.check_and_insert("a").await);
    }
}
