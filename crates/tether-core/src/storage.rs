//! Key-value persistence backends.
//!
//! The engine only needs get/set/remove/list on JSON values. Two backends
//! ship with the crate: an in-memory map (tests, ephemeral clients) and a
//! single JSON file.
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::ProtocolError;

/// Abstraction over the persistent key-value store.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, ProtocolError>;

    async fn set_item(&self, key: &str, value: Value) -> Result<(), ProtocolError>;

    async fn remove_item(&self, key: &str) -> Result<(), ProtocolError>;

    async fn get_keys(&self) -> Result<Vec<String>, ProtocolError>;
}

// ── MemoryStorage ───────────────────────────────────────────────────

/// Volatile storage. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    items: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, ProtocolError> {
        Ok(self.items().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), ProtocolError> {
        self.items().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), ProtocolError> {
        self.items().remove(key);
        Ok(())
    }

    async fn get_keys(&self) -> Result<Vec<String>, ProtocolError> {
        let mut keys: Vec<String> = self.items().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// ── FileStorage ─────────────────────────────────────────────────────

/// Storage backed by one JSON object on disk, rewritten on every change.
pub struct FileStorage {
    path: PathBuf,
    cache: tokio::sync::Mutex<Option<BTreeMap<String, Value>>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: tokio::sync::Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, Value>, ProtocolError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ProtocolError::Storage(format!("corrupt store file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(ProtocolError::Storage(e.to_string())),
        }
    }

    async fn write(&self, items: &BTreeMap<String, Value>) -> Result<(), ProtocolError> {
        let bytes = serde_json::to_vec_pretty(items)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| ProtocolError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ProtocolError::Storage(e.to_string()))
    }

    /// Run `f` against the cached map, loading it on first use. A failed
    /// write drops the cache so the next call reloads what is on disk.
    async fn with_items<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> (R, bool),
    ) -> Result<R, ProtocolError> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        let Some(items) = cache.as_mut() else {
            return Err(ProtocolError::Storage("store cache unavailable".into()));
        };
        let (result, changed) = f(items);
        let written = if changed { self.write(items).await } else { Ok(()) };
        if let Err(e) = written {
            *cache = None;
            return Err(e);
        }
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Storage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, ProtocolError> {
        self.with_items(|items| (items.get(key).cloned(), false))
            .await
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), ProtocolError> {
        self.with_items(|items| {
            items.insert(key.to_string(), value);
            ((), true)
        })
        .await
    }

    async fn remove_item(&self, key: &str) -> Result<(), ProtocolError> {
        self.with_items(|items| {
            let removed = items.remove(key).is_some();
            ((), removed)
        })
        .await
    }

    async fn get_keys(&self) -> Result<Vec<String>, ProtocolError> {
        self.with_items(|items| (items.keys().cloned().collect(), false))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.set_item("k", json!([1, 2])).await.unwrap();
        assert_eq!(storage.get_item("k").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(storage.get_keys().await.unwrap(), vec!["k".to_string()]);

        storage.remove_item("k").await.unwrap();
        assert_eq!(storage.get_item("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_storage_clones_share_state() {
        let a = MemoryStorage::new();
        let b = a.clone();
        a.set_item("shared", json!(true)).await.unwrap();
        assert_eq!(b.get_item("shared").await.unwrap(), Some(json!(true)));
    }

    #[tokio::test]
    async fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let storage = FileStorage::new(&path);
        storage
            .set_item("wc@2:core:0.3//keychain", json!({"a": "b"}))
            .await
            .unwrap();
        drop(storage);

        let reopened = FileStorage::new(&path);
        assert_eq!(
            reopened.get_item("wc@2:core:0.3//keychain").await.unwrap(),
            Some(json!({"a": "b"}))
        );
    }

    #[tokio::test]
    async fn failed_write_leaves_no_phantom_item() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("not-yet");
        let storage = FileStorage::new(parent.join("store.json"));

        assert!(matches!(
            storage.set_item("k", json!(1)).await,
            Err(ProtocolError::Storage(_))
        ));
        assert_eq!(storage.get_item("k").await.unwrap(), None);

        std::fs::create_dir(&parent).unwrap();
        storage.set_item("k", json!(2)).await.unwrap();
        assert_eq!(storage.get_item("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn file_storage_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("absent.json"));
        assert!(storage.get_keys().await.unwrap().is_empty());
        assert_eq!(storage.get_item("x").await.unwrap(), None);
    }
}
