//! Key-value state available to handlers through the processor context

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

/// State store failures
#[derive(Error, Debug)]
pub enum StateError {
    /// The backing store failed
    #[error("state backend error: {0}")]
    Backend(String),

    /// A stored value could not be (de)serialized
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StateResult<T> = Result<T, StateError>;

/// Async key-value store injected into every [`crate::ProcessorContext`]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Value stored under `key`
    async fn get(&self, key: &[u8]) -> StateResult<Option<Bytes>>;

    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &[u8], value: Bytes) -> StateResult<()>;

    /// Remove `key`
    async fn delete(&self, key: &[u8]) -> StateResult<()>;

    /// Keys starting with `prefix`, in no particular order
    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Bytes>>;

    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// JSON helpers over any [`StateStore`]
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> StateResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + Sync>(&self, key: &[u8], value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, Bytes::from(bytes)).await
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

/// Concurrent in-memory [`StateStore`]
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: DashMap<Bytes, Bytes>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Bytes>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &[u8], value: Bytes) -> StateResult<()> {
        trace!(key_len = key.len(), value_len = value.len(), "State put");
        self.entries.insert(Bytes::copy_from_slice(key), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Bytes>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}
