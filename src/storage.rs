//! Durable string key-value storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::error::Result;

/// Key-value store shared by the bot's components.
///
/// Reads are served from memory; writes are durable once they return.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Stores `default` under `key` unless a value is already present.
    async fn set_if_not_exists(&self, key: &str, default: &str) -> Result<()>;
}

/// Store backed by a single JSON object on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
    // Serializes flushes so an older snapshot never overwrites a newer one.
    flush: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No storage file at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} keys from {}", entries.len(), path.display());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            flush: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.flush.lock().await;
        let bytes = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_vec_pretty(&*entries)?
        };

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        self.persist().await
    }

    async fn set_if_not_exists(&self, key: &str, default: &str) -> Result<()> {
        let inserted = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(key.to_string(), default.to_string());
                true
            }
        };
        if inserted {
            debug!("Initialized storage key {key}");
            self.persist().await?;
        }
        Ok(())
    }
}

/// Non-durable store, handy for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_not_exists(&self, key: &str, default: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_insert_with(|| default.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::open(dir.path().join("store.json"))
            .await
            .expect("open");
        assert_eq!(store.get("gpt_answered"), None);
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");

        let store = JsonFileStore::open(&path).await.expect("open");
        store.set("gpt_token", "abc").await.expect("set");
        store
            .set_if_not_exists("gpt_answered", "0")
            .await
            .expect("set_if_not_exists");
        drop(store);

        let reopened = JsonFileStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.get("gpt_token").as_deref(), Some("abc"));
        assert_eq!(reopened.get("gpt_answered").as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn set_if_not_exists_keeps_existing_value() {
        let store = MemoryStore::new();
        store.set("gpt_answered", "41").await.expect("set");
        store
            .set_if_not_exists("gpt_answered", "0")
            .await
            .expect("set_if_not_exists");
        assert_eq!(store.get("gpt_answered").as_deref(), Some("41"));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        tokio::fs::write(&path, b"not json").await.expect("write");
        assert!(JsonFileStore::open(&path).await.is_err());
    }
}
