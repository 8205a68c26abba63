use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::StorageError;

/// Durable key-value persistence for JSON payloads.
///
/// Everything the monitor stores goes through these three calls, so the
/// SQLite-backed store and the in-memory store behave identically for
/// merge and dedup purposes. A single `set` replaces the whole value
/// atomically; callers that read-modify-write serialize themselves, which
/// holds only while one process owns the store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Release the backend and any lock it holds. Later calls may fail.
    async fn close(&self) {}

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

pub type SharedStore = Arc<dyn KvStore>;

/// Read and decode a JSON value.
pub(crate) async fn read_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match kv.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub(crate) async fn write_json<T: Serialize + ?Sized>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value).map_err(|source| StorageError::Encode {
        key: key.to_string(),
        source,
    })?;
    kv.set(key, &raw).await
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Process-local store for environments without a database file.
///
/// Values are kept as serialized JSON, exactly as the SQLite store keeps them,
/// so decoding errors and key layout are the same on both backends.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
