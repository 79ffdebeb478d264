//! In-memory storage backend, used for tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::storage::KvStore;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.values.lock().map(|values| values.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_values<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Value>) -> T) -> Result<T> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| AppError::storage(key, "memory storage lock poisoned"))?;
        Ok(f(&mut values))
    }
}

#[async_trait]
impl KvStore for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.with_values(key, |values| values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.with_values(key, |values| {
            values.insert(key.to_string(), value);
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_values(key, |values| {
            values.remove(key);
        })
    }

    async fn scan(&self, prefix: &str) -> Result<BTreeMap<String, Value>> {
        self.with_values(prefix, |values| {
            values
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
    }
}
