// src/services/unread.rs

//! Unread total accounting.
//!
//! The total is maintained incrementally from the deltas of successful entry
//! writes. A full recompute from the cache happens once at startup; after
//! that, [`UnreadAccounter::check_consistency`] only reports drift.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, watch};

use crate::error::Result;
use crate::services::EntryCache;
use crate::storage::{KvStore, UNREAD_TOTAL_KEY};
use crate::utils::retry::{RetryPolicy, with_retry};

/// Receiver of unread total changes, e.g. a badge renderer.
///
/// Delivery is best effort: implementations must not block and cannot fail.
pub trait UnreadSink: Send + Sync {
    fn unread_total_changed(&self, total: u64);
}

/// Sink that only logs the new total.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl UnreadSink for LogSink {
    fn unread_total_changed(&self, total: u64) {
        log::info!("Unread total is now {total}");
    }
}

/// Stored total disagreeing with the sum over cached entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence {
    pub stored: u64,
    pub actual: u64,
}

/// Running sum of every entry's unread count.
pub struct UnreadAccounter {
    kv: Arc<dyn KvStore>,
    retry: RetryPolicy,
    total: Mutex<u64>,
    notifier: watch::Sender<u64>,
    sink: Option<Arc<dyn UnreadSink>>,
}

impl UnreadAccounter {
    pub fn new(kv: Arc<dyn KvStore>, retry: RetryPolicy) -> Self {
        let (notifier, _) = watch::channel(0);
        Self {
            kv,
            retry,
            total: Mutex::new(0),
            notifier,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn UnreadSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Current total.
    pub fn total(&self) -> u64 {
        *self.notifier.borrow()
    }

    /// Watch the total; every published change is observable.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    /// Read the total last persisted, if any.
    pub async fn persisted_total(&self) -> Result<Option<u64>> {
        let value = with_retry(&self.retry, "read unread total", || {
            self.kv.get(UNREAD_TOTAL_KEY)
        })
        .await?;
        Ok(value.and_then(|v| v.as_u64()))
    }

    /// Add a signed delta, clamping at zero. Returns the new total.
    pub async fn adjust(&self, delta: i64) -> u64 {
        let mut total = self.total.lock().await;
        if delta == 0 {
            return *total;
        }
        let next = if delta >= 0 {
            total.saturating_add(delta.unsigned_abs())
        } else {
            total.saturating_sub(delta.unsigned_abs())
        };
        self.publish(&mut total, next).await;
        next
    }

    /// Replace the total with the sum over the cache.
    pub async fn recompute(&self, cache: &EntryCache) -> Result<u64> {
        let actual = cache.unread_sum()?;
        let mut total = self.total.lock().await;
        self.publish(&mut total, actual).await;
        log::info!("Unread total recomputed: {actual}");
        Ok(actual)
    }

    /// Compare the running total with the cache without correcting it.
    pub async fn check_consistency(&self, cache: &EntryCache) -> Result<Option<Divergence>> {
        let actual = cache.unread_sum()?;
        let stored = *self.total.lock().await;
        if stored == actual {
            return Ok(None);
        }
        log::warn!("Unread total drifted: running total {stored}, entries sum to {actual}");
        Ok(Some(Divergence { stored, actual }))
    }

    /// Persist and announce a new total while holding the lock.
    async fn publish(&self, total: &mut u64, next: u64) {
        *total = next;
        // on failure the in-memory total stays authoritative
        if let Err(e) = with_retry(&self.retry, "persist unread total", || {
            self.kv.set(UNREAD_TOTAL_KEY, Value::from(next))
        })
        .await
        {
            log::warn!("Unread total {next} not persisted: {e}");
        }
        self.notifier.send_replace(next);
        if let Some(sink) = &self.sink {
            sink.unread_total_changed(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackedEntry;
    use crate::storage::MemoryStorage;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: StdMutex<Vec<u64>>,
    }

    impl UnreadSink for RecordingSink {
        fn unread_total_changed(&self, total: u64) {
            self.seen.lock().unwrap().push(total);
        }
    }

    fn accounter(kv: Arc<MemoryStorage>) -> UnreadAccounter {
        UnreadAccounter::new(kv, RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_adjust_clamps_and_persists() {
        let kv = Arc::new(MemoryStorage::new());
        let sink = Arc::new(RecordingSink::default());
        let acc = accounter(kv.clone()).with_sink(sink.clone());

        assert_eq!(acc.adjust(3).await, 3);
        assert_eq!(acc.adjust(-5).await, 0);
        assert_eq!(acc.adjust(0).await, 0);
        assert_eq!(acc.adjust(2).await, 2);

        assert_eq!(acc.total(), 2);
        assert_eq!(acc.persisted_total().await.unwrap(), Some(2));
        assert_eq!(*sink.seen.lock().unwrap(), vec![3, 0, 2]);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let acc = accounter(Arc::new(MemoryStorage::new()));
        let mut rx = acc.subscribe();

        acc.adjust(4).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 4);
    }

    #[tokio::test]
    async fn test_recompute_and_consistency_check() {
        let acc = accounter(Arc::new(MemoryStorage::new()));
        let cache = EntryCache::new();
        let mut a = TrackedEntry::new("1", "1", 3);
        a.unread_count = 3;
        let mut b = TrackedEntry::new("1", "2", 9);
        b.unread_count = 4;
        cache.replace_all(vec![a, b]).unwrap();

        assert_eq!(acc.recompute(&cache).await.unwrap(), 7);
        assert_eq!(acc.check_consistency(&cache).await.unwrap(), None);

        acc.adjust(1).await;
        assert_eq!(
            acc.check_consistency(&cache).await.unwrap(),
            Some(Divergence {
                stored: 8,
                actual: 7
            })
        );
        // Divergence is reported, never corrected.
        assert_eq!(acc.total(), 8);
    }
}
