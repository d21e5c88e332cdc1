//! Key-value store collaborator
//!
//! Stores named JSON documents: statistics snapshots, session pool state and
//! handler `use_state` blobs all go through this interface. The in-memory
//! implementation backs tests and ephemeral runs, the file-system one
//! provides best-effort persistence across restarts.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::StorageError;

/// Abstract key-value store over JSON documents.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn iterate_keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    records: DashMap<String, Value>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.records.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.records.remove(key);
        Ok(())
    }

    async fn iterate_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

/// File-system key-value store: one JSON file per key inside a directory.
#[derive(Debug)]
pub struct FileSystemKeyValueStore {
    dir: PathBuf,
}

impl FileSystemKeyValueStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }
}

/// Keep keys filesystem-safe without losing readability.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl KeyValueStore for FileSystemKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(&value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        tokio::fs::write(self.path_for(key), bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn iterate_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryKeyValueStore::new();
        store.set("a", json!({"x": 1})).await.expect("set succeeds");
        assert_eq!(
            store.get("a").await.expect("get succeeds"),
            Some(json!({"x": 1}))
        );
        store.delete("a").await.expect("delete succeeds");
        assert_eq!(store.get("a").await.expect("get succeeds"), None);
    }

    #[tokio::test]
    async fn memory_store_lists_keys_sorted() {
        let store = MemoryKeyValueStore::new();
        store.set("b", json!(2)).await.expect("set");
        store.set("a", json!(1)).await.expect("set");
        assert_eq!(
            store.iterate_keys().await.expect("keys"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSystemKeyValueStore::new(dir.path());
        store
            .set("stats/latest", json!({"requestsFinished": 3}))
            .await
            .expect("set");
        let value = store.get("stats/latest").await.expect("get");
        assert_eq!(value, Some(json!({"requestsFinished": 3})));
        assert_eq!(
            store.iterate_keys().await.expect("keys"),
            vec!["stats_latest".to_string()]
        );
    }

    #[tokio::test]
    async fn file_store_missing_key_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSystemKeyValueStore::new(dir.path());
        assert_eq!(store.get("missing").await.expect("get"), None);
        store.delete("missing").await.expect("delete is idempotent");
    }
}
