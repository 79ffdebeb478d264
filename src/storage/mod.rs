//! Key-value persistence backends.
//!
//! The tracker persists everything as JSON values under flat string keys:
//!
//! ```text
//! entry:{topic_id}:{entry_id}   # one TrackedEntry per key
//! unread:total                  # running unread total
//! settings:crawl_enabled        # poll loop switch
//! ```
//!
//! Backends make no consistency promises beyond single-key atomicity;
//! conflict detection lives in [`crate::services::EntryStore`].

pub mod local;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

// Re-export for convenience
pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// Key of the persisted unread total.
pub const UNREAD_TOTAL_KEY: &str = "unread:total";

/// Key of the persisted crawl switch.
pub const CRAWL_ENABLED_KEY: &str = "settings:crawl_enabled";

/// Trait for key-value persistence backends.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value, `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a key. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every key starting with `prefix`, with its value.
    async fn scan(&self, prefix: &str) -> Result<BTreeMap<String, Value>>;
}
