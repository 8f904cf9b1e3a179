//! Content addressed storage.
//!
//! The replication loop and the publish pipeline only need to store a document, check and
//! create pins, and read a few statistics. [`KuboStore`] talks to an IPFS node's HTTP API,
//! [`MemStore`] keeps everything in memory.

use std::{future::Future, time::Duration};

pub mod kubo;
pub mod mem;

pub use self::{kubo::KuboStore, mem::MemStore};

/// Errors from the content store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection level failure.
    #[error("content store unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    /// The request did not complete in time.
    #[error("{op} timed out after {timeout:?}")]
    Timeout {
        /// The operation.
        op: &'static str,
        /// The timeout that expired.
        timeout: Duration,
    },
    /// The store rejected the request.
    #[error("{op} failed: {message}")]
    Api {
        /// The operation.
        op: &'static str,
        /// Error message from the store.
        message: String,
    },
    /// The store answered with something we do not understand.
    #[error("invalid response to {op}: {reason}")]
    Invalid {
        /// The operation.
        op: &'static str,
        /// What was wrong.
        reason: String,
    },
    /// The API endpoint could not be parsed.
    #[error("invalid store api address {0:?}")]
    InvalidEndpoint(String),
    /// The store is offline. Only produced by [`MemStore`].
    #[error("content store offline")]
    Offline,
}

/// Usage statistics of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    /// Number of recursively pinned objects.
    pub pinned_count: u64,
    /// Bytes used by the store's repository.
    pub storage_bytes: u64,
}

impl StoreStats {
    /// Storage in GiB, for display.
    pub fn storage_gib(&self) -> f64 {
        self.storage_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// A content addressed store that can pin.
///
/// Pinning must be idempotent: pinning an address that is already pinned is a cheap no-op,
/// and identical concurrent pin requests are safe.
pub trait ContentStore: Send + Sync {
    /// Check that the store is reachable.
    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Store `document` and return its content address.
    fn store(&self, document: &[u8]) -> impl Future<Output = Result<String, StoreError>> + Send;

    /// Whether `content_address` is pinned.
    fn is_pinned(
        &self,
        content_address: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Pin `content_address`, fetching the content if needed.
    fn pin(&self, content_address: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Current usage statistics.
    fn stats(&self) -> impl Future<Output = Result<StoreStats, StoreError>> + Send;
}
