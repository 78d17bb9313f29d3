//! Access to the meta KV store.
//!
//! The store itself is an external, leader-replicated component; the service
//! only depends on the small `MetaStore` surface below. `MemStore` implements
//! it in memory and backs the tests and local runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found")]
    KeyNotFound,
    /// The store leader moved; the write may not have been applied.
    #[error("store leader changed")]
    LeaderChanged,
    #[error("store failure: {0}")]
    Internal(String),
}

pub type KV = (Vec<u8>, Vec<u8>);

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// All pairs whose key starts with `prefix`, in key order.
    async fn prefix(&self, prefix: &[u8]) -> Result<Vec<KV>, StoreError>;

    /// Atomically apply a batch of writes.
    async fn multi_put(&self, kvs: Vec<KV>) -> Result<(), StoreError>;

    async fn remove(&self, key: &[u8]) -> Result<(), StoreError>;
}

/// In-memory `MetaStore` on an ordered map.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemStore {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let map = self.inner.read().await;
        map.get(key).cloned().ok_or(StoreError::KeyNotFound)
    }

    async fn prefix(&self, prefix: &[u8]) -> Result<Vec<KV>, StoreError> {
        let map = self.inner.read().await;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn multi_put(&self, kvs: Vec<KV>) -> Result<(), StoreError> {
        let mut map = self.inner.write().await;
        for (key, value) in kvs {
            map.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut map = self.inner.write().await;
        map.remove(key);
        Ok(())
    }
}

/// Guards placement reads against concurrent space schema changes. Placement
/// scans hold it for read; schema mutations take it for write.
#[derive(Default)]
pub struct SpaceLock {
    inner: RwLock<()>,
}

impl SpaceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().await
    }
}
