// src/services/entry_store.rs

//! Conflict-safe persistence of tracked entries.
//!
//! Writes use optimistic concurrency: the persisted record is read, the
//! incoming entry is rejected if the persisted one carries a strictly later
//! `updated_at`, and otherwise the entry is written with a bumped version and
//! a fresh timestamp. Nothing is locked between the read and the write, so
//! the timestamp comparison is the only gate between racing writers.
//!
//! After every successful write or delete the store refreshes the
//! [`EntryCache`] and forwards the unread delta to the [`UnreadAccounter`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{ENTRY_PREFIX, EntryKey, StorageConfig, TrackedEntry};
use crate::services::{EntryCache, UnreadAccounter};
use crate::storage::KvStore;
use crate::utils::retry::{RetryPolicy, with_retry};

/// Result of [`EntryStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The entry as persisted, with its new version and timestamp
    Written(TrackedEntry),
    /// A newer record already exists and was left untouched
    Stale { persisted: TrackedEntry },
}

impl PutOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, PutOutcome::Written(_))
    }
}

/// Authoritative store of tracked entries.
pub struct EntryStore {
    kv: Arc<dyn KvStore>,
    cache: Arc<EntryCache>,
    accounter: Arc<UnreadAccounter>,
    retry: RetryPolicy,
    max_entries: usize,
}

impl EntryStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        cache: Arc<EntryCache>,
        accounter: Arc<UnreadAccounter>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            kv,
            cache,
            accounter,
            retry: config.retry_policy(),
            max_entries: config.max_entries.max(1),
        }
    }

    pub fn cache(&self) -> &Arc<EntryCache> {
        &self.cache
    }

    pub fn accounter(&self) -> &Arc<UnreadAccounter> {
        &self.accounter
    }

    /// Read the persisted record for `key`.
    pub async fn get(&self, key: &EntryKey) -> Result<Option<TrackedEntry>> {
        let storage_key = key.storage_key();
        let value = with_retry(&self.retry, &format!("read {storage_key}"), || {
            self.kv.get(&storage_key)
        })
        .await?;
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Write `entry` unless a newer record is already persisted.
    ///
    /// Transient persistence failures are retried; once retries are
    /// exhausted the error is returned and nothing has changed.
    pub async fn put(&self, mut entry: TrackedEntry) -> Result<PutOutcome> {
        let key = entry.key();
        let storage_key = key.storage_key();

        // Unread count of an undecodable record, taken from the cache.
        let mut unreadable_unread = None;
        let persisted = match self.get(&key).await {
            Ok(persisted) => persisted,
            Err(AppError::Json(e)) => {
                log::warn!("Overwriting undecodable record {storage_key}: {e}");
                unreadable_unread = Some(self.cache.get(&key)?.map_or(0, |c| c.unread_count));
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(current) = &persisted {
            if let (Some(persisted_at), Some(incoming_at)) = (current.updated_at, entry.updated_at) {
                if persisted_at > incoming_at {
                    log::info!(
                        "Rejected stale write for {key}: persisted {persisted_at} is newer than {incoming_at}"
                    );
                    return Ok(PutOutcome::Stale {
                        persisted: current.clone(),
                    });
                }
            }
        }

        let previous_unread = persisted
            .as_ref()
            .map(|p| p.unread_count)
            .or(unreadable_unread)
            .unwrap_or(0);
        entry.version = persisted.as_ref().map_or(1, |p| p.version + 1);
        entry.updated_at = Some(next_timestamp(
            persisted.as_ref().and_then(|p| p.updated_at),
        ));
        if let Some(current) = &persisted {
            entry.created_at = current.created_at;
        }

        let value = serde_json::to_value(&entry)?;
        with_retry(&self.retry, &format!("write {storage_key}"), || {
            self.kv.set(&storage_key, value.clone())
        })
        .await?;

        let written = self.refresh_cached(&key, entry).await?;
        self.accounter
            .adjust(unread_delta(previous_unread, written.unread_count))
            .await;

        if persisted.is_none() && unreadable_unread.is_none() {
            if let Err(e) = self.evict_overflow().await {
                log::warn!("Capacity eviction after inserting {key} failed: {e}");
            }
        }

        Ok(PutOutcome::Written(written))
    }

    /// Every decodable persisted entry. Undecodable records are skipped.
    pub async fn load_all(&self) -> Result<Vec<TrackedEntry>> {
        self.load_prefix(ENTRY_PREFIX).await
    }

    /// Every persisted entry of one topic.
    pub async fn load_topic(&self, topic_id: &str) -> Result<Vec<TrackedEntry>> {
        self.load_prefix(&EntryKey::topic_prefix(topic_id)).await
    }

    /// Remove an entry. Returns the removed record, `None` if it was absent.
    pub async fn delete(&self, key: &EntryKey) -> Result<Option<TrackedEntry>> {
        let storage_key = key.storage_key();
        let persisted = self.get(key).await.unwrap_or_else(|e| {
            log::warn!("Deleting {storage_key} without reading it first: {e}");
            None
        });

        with_retry(&self.retry, &format!("delete {storage_key}"), || {
            self.kv.delete(&storage_key)
        })
        .await?;

        let cached = self.cache.remove(key)?;
        let removed_unread = persisted
            .as_ref()
            .or(cached.as_ref())
            .map_or(0, |e| e.unread_count);
        self.accounter.adjust(unread_delta(removed_unread, 0)).await;

        Ok(persisted.or(cached))
    }

    /// Remove every entry of a topic. Returns how many were removed.
    pub async fn delete_topic(&self, topic_id: &str) -> Result<usize> {
        let prefix = EntryKey::topic_prefix(topic_id);
        let keys = self.scan_keys(&prefix).await?;
        let mut removed = 0;
        for key in keys {
            if self.delete(&key).await?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete the least recently updated entries beyond the configured maximum.
    async fn evict_overflow(&self) -> Result<usize> {
        let mut entries = self.load_all().await?;
        if entries.len() <= self.max_entries {
            return Ok(0);
        }

        entries.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.key().cmp(&b.key()))
        });
        let overflow = entries.len() - self.max_entries;
        for victim in entries.iter().take(overflow) {
            let key = victim.key();
            self.delete(&key).await?;
            log::info!(
                "Evicted {key} (last updated {:?}) to stay within {} entries",
                victim.updated_at,
                self.max_entries
            );
        }
        Ok(overflow)
    }

    async fn scan(&self, prefix: &str) -> Result<std::collections::BTreeMap<String, Value>> {
        with_retry(&self.retry, &format!("scan {prefix}"), || self.kv.scan(prefix)).await
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<EntryKey>> {
        Ok(self
            .scan(prefix)
            .await?
            .keys()
            .filter_map(|k| EntryKey::from_storage_key(k))
            .collect())
    }

    async fn load_prefix(&self, prefix: &str) -> Result<Vec<TrackedEntry>> {
        let mut entries = Vec::new();
        for (key, value) in self.scan(prefix).await? {
            match serde_json::from_value::<TrackedEntry>(value) {
                Ok(entry) if entry.key().storage_key() == key => entries.push(entry),
                Ok(entry) => {
                    log::warn!("Skipping {key}: record belongs to {}", entry.key());
                }
                Err(e) => log::warn!("Skipping undecodable record {key}: {e}"),
            }
        }
        Ok(entries)
    }

    /// Re-read the just-written record so the cache holds what was persisted.
    async fn refresh_cached(&self, key: &EntryKey, written: TrackedEntry) -> Result<TrackedEntry> {
        let persisted = match self.get(key).await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => {
                log::warn!("{key} vanished right after being written");
                written
            }
            Err(e) => {
                log::warn!("Could not re-read {key} after write: {e}");
                written
            }
        };
        self.cache.insert(persisted.clone())?;
        Ok(persisted)
    }
}

/// A write timestamp strictly later than the one it replaces.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev >= now => prev + Duration::microseconds(1),
        _ => now,
    }
}

fn unread_delta(before: u64, after: u64) -> i64 {
    let delta = i128::from(after) - i128::from(before);
    delta.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}
