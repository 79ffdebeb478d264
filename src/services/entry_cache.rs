// src/services/entry_cache.rs

//! In-memory mirror of the persisted entries.
//!
//! Never written independently: [`crate::services::EntryStore`] refreshes it
//! from the persisted record after every successful write or delete.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{AppError, Result};
use crate::models::{EntryKey, TrackedEntry};
use crate::services::EntryStore;

#[derive(Debug, Default)]
pub struct EntryCache {
    entries: RwLock<HashMap<EntryKey, TrackedEntry>>,
}

impl EntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repopulate from the store. Returns the number of entries loaded.
    pub async fn load_from_store(&self, store: &EntryStore) -> Result<usize> {
        let entries = store.load_all().await?;
        let count = entries.len();
        self.replace_all(entries)?;
        log::info!("Loaded {count} tracked entries into cache");
        Ok(count)
    }

    pub fn replace_all(&self, entries: Vec<TrackedEntry>) -> Result<()> {
        let mut map = self.write()?;
        map.clear();
        map.extend(entries.into_iter().map(|entry| (entry.key(), entry)));
        Ok(())
    }

    /// Snapshot of all entries, oldest tracked first.
    pub fn get_all(&self) -> Result<Vec<TrackedEntry>> {
        let mut entries: Vec<TrackedEntry> = self.read()?.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key().cmp(&b.key()))
        });
        Ok(entries)
    }

    pub fn get(&self, key: &EntryKey) -> Result<Option<TrackedEntry>> {
        Ok(self.read()?.get(key).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Sum of unread counts across all cached entries.
    pub fn unread_sum(&self) -> Result<u64> {
        Ok(self
            .read()?
            .values()
            .fold(0u64, |sum, entry| sum.saturating_add(entry.unread_count)))
    }

    pub(crate) fn insert(&self, entry: TrackedEntry) -> Result<()> {
        self.write()?.insert(entry.key(), entry);
        Ok(())
    }

    pub(crate) fn remove(&self, key: &EntryKey) -> Result<Option<TrackedEntry>> {
        Ok(self.write()?.remove(key))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<EntryKey, TrackedEntry>>> {
        self.entries
            .read()
            .map_err(|_| AppError::cache("entry cache lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<EntryKey, TrackedEntry>>> {
        self.entries
            .write()
            .map_err(|_| AppError::cache("entry cache lock poisoned"))
    }
}
