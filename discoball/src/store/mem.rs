//! In-memory content store.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{ContentStore, StoreError, StoreStats};
use crate::abi::keccak256;

/// In-memory [`ContentStore`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    pinned: BTreeSet<String>,
    failing: HashSet<String>,
    offline: bool,
    pin_requests: u64,
}

impl MemStore {
    /// An empty, online store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("poisoned")
    }

    fn online(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock();
        if inner.offline {
            return Err(StoreError::Offline);
        }
        Ok(inner)
    }

    /// Take the store offline or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Make pins of `content_address` fail.
    pub fn fail_pins_of(&self, content_address: &str) {
        self.lock().failing.insert(content_address.to_string());
    }

    /// Number of pin requests that reached the store.
    pub fn pin_requests(&self) -> u64 {
        self.lock().pin_requests
    }

    /// All pinned addresses.
    pub fn pinned(&self) -> BTreeSet<String> {
        self.lock().pinned.clone()
    }

    /// The document stored under `content_address`.
    pub fn get(&self, content_address: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(content_address).cloned()
    }
}

impl ContentStore for MemStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.online().map(|_| ())
    }

    async fn store(&self, document: &[u8]) -> Result<String, StoreError> {
        let mut inner = self.online()?;
        let address = format!("mem{}", hex::encode(&keccak256(document)[..16]));
        inner.blobs.insert(address.clone(), document.to_vec());
        // adding content pins it, like `ipfs add`
        inner.pinned.insert(address.clone());
        Ok(address)
    }

    async fn is_pinned(&self, content_address: &str) -> Result<bool, StoreError> {
        Ok(self.online()?.pinned.contains(content_address))
    }

    async fn pin(&self, content_address: &str) -> Result<(), StoreError> {
        let mut inner = self.online()?;
        inner.pin_requests += 1;
        if inner.failing.contains(content_address) {
            return Err(StoreError::Api {
                op: "pin/add",
                message: format!("could not fetch {content_address}"),
            });
        }
        inner.pinned.insert(content_address.to_string());
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let inner = self.online()?;
        Ok(StoreStats {
            pinned_count: inner.pinned.len() as u64,
            storage_bytes: inner.blobs.values().map(|b| b.len() as u64).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pin_is_idempotent() {
        let store = MemStore::new();
        store.pin("QmA").await.unwrap();
        store.pin("QmA").await.unwrap();
        assert!(store.is_pinned("QmA").await.unwrap());
        assert_eq!(store.stats().await.unwrap().pinned_count, 1);
    }

    #[tokio::test]
    async fn store_is_content_addressed() {
        let store = MemStore::new();
        let a = store.store(b"hello").await.unwrap();
        let b = store.store(b"hello").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.get(&a).unwrap(), b"hello");
        assert!(store.is_pinned(&a).await.unwrap());
    }

    #[tokio::test]
    async fn offline_store_fails_everything() {
        let store = MemStore::new();
        store.set_offline(true);
        assert!(matches!(store.ping().await, Err(StoreError::Offline)));
        assert!(store.pin("QmA").await.is_err());
    }
}
