//! Local filesystem storage implementation.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── config.toml           # Tracker Configuration
//! └── kv/                   # One JSON document per key
//!     └── {hex(key)}.json
//! ```
//!
//! File names are the hex-encoded key so that any key is a valid file name
//! and prefix scans can decode names back without an index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::KvStore;

const KV_DIR: &str = "kv";

/// Distinguishes temp files of concurrent writes to the same key.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root_dir: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    fn kv_dir(&self) -> PathBuf {
        self.root_dir.join(KV_DIR)
    }

    /// Get the full path for a key.
    fn path(&self, key: &str) -> PathBuf {
        self.kv_dir().join(format!("{}.json", hex::encode(key)))
    }

    /// Recover the key from a file name produced by [`Self::path`].
    fn key_from_file_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(".json")?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{}.{seq}.tmp", std::process::id()));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::Io(e));
        }
        Ok(())
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}

#[async_trait]
impl KvStore for LocalStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.read_bytes(&self.path(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&value)?;
        self.write_bytes(&self.path(key), &bytes).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<BTreeMap<String, Value>> {
        let mut found = BTreeMap::new();
        let mut dir = match tokio::fs::read_dir(self.kv_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(AppError::Io(e)),
        };

        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(key) = name.to_str().and_then(Self::key_from_file_name) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            // Unreadable documents are surfaced as null so callers can log and skip them.
            let value = match self.read_bytes(&item.path()).await? {
                Some(bytes) => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
                None => continue,
            };
            found.insert(key, value);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        storage.set("entry:1:2", json!({"a": 1})).await.unwrap();
        let value = storage.get("entry:1:2").await.unwrap();
        assert_eq!(value, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        assert!(storage.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        storage.set("k", json!(1)).await.unwrap();
        storage.delete("k").await.unwrap();
        storage.delete("k").await.unwrap();
        assert!(storage.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_filters_prefix_and_skips_foreign_files() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        storage.set("entry:1:1", json!(1)).await.unwrap();
        storage.set("entry:1:2", json!(2)).await.unwrap();
        storage.set("unread:total", json!(3)).await.unwrap();
        tokio::fs::write(tmp.path().join("kv/notes.txt"), b"x")
            .await
            .unwrap();
        tokio::fs::write(storage.path("entry:9:9"), b"{broken")
            .await
            .unwrap();

        let found = storage.scan("entry:").await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found["entry:1:2"], json!(2));
        assert_eq!(found["entry:9:9"], Value::Null);
    }

    #[tokio::test]
    async fn test_scan_without_directory() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path().join("missing"));
        assert!(storage.scan("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_key_stay_decodable() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let big = json!({ "body": "x".repeat(64 * 1024) });
        let small = json!({ "body": "y" });

        for _ in 0..50 {
            let (a, b) = tokio::join!(
                storage.set("entry:1:1", big.clone()),
                storage.set("entry:1:1", small.clone())
            );
            a.unwrap();
            b.unwrap();

            let value = storage.get("entry:1:1").await.unwrap().unwrap();
            assert!(value == big || value == small);
        }

        let mut dir = tokio::fs::read_dir(tmp.path().join(KV_DIR)).await.unwrap();
        let mut files = 0;
        while let Some(item) = dir.next_entry().await.unwrap() {
            assert!(item.file_name().to_str().unwrap().ends_with(".json"));
            files += 1;
        }
        assert_eq!(files, 1);
    }

    #[test]
    fn test_file_name_roundtrip() {
        let storage = LocalStorage::new("/tmp/x");
        let path = storage.path("entry:12:34");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(
            LocalStorage::key_from_file_name(name),
            Some("entry:12:34".to_string())
        );
        assert_eq!(LocalStorage::key_from_file_name("zz.json"), None);
    }
}
