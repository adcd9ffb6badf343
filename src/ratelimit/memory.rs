//! In-process counter store.
//!
//! Backed by a `DashMap`; each primitive runs under the entry lock of its key,
//! which makes read-increment-compare atomic per key. State lives only in this
//! process: deployments running several instances must use
//! [`RedisStore`](super::RedisStore) or limits are enforced per instance.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;

use super::backend::{refill_and_take, BucketSpec, BucketState, CounterStore};
use crate::error::Result;

#[derive(Debug)]
enum Slot {
    Counter(u64),
    Log(VecDeque<u64>),
    Bucket { tokens: f64, last_refill_ms: u64 },
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at_ms: u64,
}

impl Entry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Thread-safe in-memory counter store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, now: Duration, ttl: Duration) -> Result<u64> {
        let now_ms = millis(now);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Counter(0),
            expires_at_ms: now_ms + millis(ttl),
        });

        if entry.is_expired(now_ms) || !matches!(entry.slot, Slot::Counter(_)) {
            entry.slot = Slot::Counter(0);
            entry.expires_at_ms = now_ms + millis(ttl);
        }

        let count = match &mut entry.slot {
            Slot::Counter(count) => {
                *count += 1;
                *count
            }
            _ => unreachable!("slot reset to a counter above"),
        };
        trace!(key = %key, count, "Incremented fixed window");
        Ok(count)
    }

    async fn record_and_count(&self, key: &str, now: Duration, window: Duration) -> Result<u64> {
        let now_ms = millis(now);
        let cutoff = now_ms.saturating_sub(millis(window));
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Log(VecDeque::new()),
            expires_at_ms: now_ms + millis(window),
        });

        if !matches!(entry.slot, Slot::Log(_)) {
            entry.slot = Slot::Log(VecDeque::new());
        }
        entry.expires_at_ms = now_ms + millis(window);

        let count = match &mut entry.slot {
            Slot::Log(log) => {
                while log.front().is_some_and(|&t| t <= cutoff) {
                    log.pop_front();
                }
                log.push_back(now_ms);
                log.len() as u64
            }
            _ => unreachable!("slot reset to a log above"),
        };
        trace!(key = %key, count, "Recorded sliding window entry");
        Ok(count)
    }

    async fn take_token(&self, key: &str, now: Duration, spec: BucketSpec) -> Result<BucketState> {
        let now_ms = millis(now);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Bucket {
                tokens: spec.capacity,
                last_refill_ms: now_ms,
            },
            expires_at_ms: now_ms + millis(spec.ttl),
        });

        if entry.is_expired(now_ms) || !matches!(entry.slot, Slot::Bucket { .. }) {
            entry.slot = Slot::Bucket {
                tokens: spec.capacity,
                last_refill_ms: now_ms,
            };
        }
        entry.expires_at_ms = now_ms + millis(spec.ttl);

        let state = match &mut entry.slot {
            Slot::Bucket {
                tokens,
                last_refill_ms,
            } => {
                let state = refill_and_take(*tokens, *last_refill_ms, now_ms, &spec);
                *tokens = state.tokens;
                *last_refill_ms = now_ms;
                state
            }
            _ => unreachable!("slot reset to a bucket above"),
        };
        trace!(key = %key, tokens = state.tokens, allowed = state.allowed, "Took from bucket");
        Ok(state)
    }

    async fn purge_expired(&self, now: Duration) -> Result<usize> {
        let now_ms = millis(now);
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now_ms));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const T0: Duration = Duration::from_secs(1_000);

    #[tokio::test]
    async fn test_increment_counts_and_expires() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(1);

        assert_eq!(store.increment("k", T0, ttl).await.unwrap(), 1);
        assert_eq!(store.increment("k", T0, ttl).await.unwrap(), 2);
        assert_eq!(
            store.increment("k", T0 + Duration::from_millis(1_000), ttl).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_sliding_log_prunes_old_entries() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);

        for i in 0..3 {
            let now = T0 + Duration::from_secs(i);
            store.record_and_count("k", now, window).await.unwrap();
        }
        // Entries at T0 and T0+1s fall out of (now - 10s, now].
        let count = store
            .record_and_count("k", T0 + Duration::from_secs(11), window)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_bucket_starts_full() {
        let store = MemoryStore::new();
        let spec = BucketSpec::for_window(3, Duration::from_secs(3));

        for _ in 0..3 {
            assert!(store.take_token("k", T0, spec).await.unwrap().allowed);
        }
        assert!(!store.take_token("k", T0, spec).await.unwrap().allowed);
        assert!(store
            .take_token("k", T0 + Duration::from_secs(1), spec)
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.increment("a", T0, Duration::from_secs(1)).await.unwrap();
        store.increment("b", T0, Duration::from_secs(60)).await.unwrap();

        let removed = store.purge_expired(T0 + Duration::from_secs(2)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.increment("shared", T0, Duration::from_secs(60)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(
            store.increment("shared", T0, Duration::from_secs(60)).await.unwrap(),
            51
        );
    }
}
