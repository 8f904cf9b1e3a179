//! Access to the on-chain registry.
//!
//! The registry is reached through three narrow traits so the watcher, the replication loop
//! and the publish pipeline can each be driven by the real node ([`RpcLedger`]) or by the
//! in-memory [`MemLedger`].

use std::future::Future;

use crate::{abi::AbiError, address::Address, entry::EventPosition, rpc::RpcError, signer};

pub mod mem;
mod rpc;

pub use self::{
    mem::MemLedger,
    rpc::{RpcLedger, DEFAULT_CONFIRMATION_TIMEOUT},
};
pub use crate::rpc::SyncStatus;

/// A registry event as it comes off the ledger, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Where in the log the event sits.
    pub position: EventPosition,
    /// ABI encoded non-indexed fields.
    pub data: Vec<u8>,
}

/// Result of a confirmed registry write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// Hash of the transaction.
    pub tx_hash: String,
    /// Block the transaction was included in.
    pub block: u64,
}

/// Errors talking to the registry.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The node could not be reached or refused the request.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The node answered with data that does not decode.
    #[error("malformed contract response: {0}")]
    Abi(#[from] AbiError),
    /// No private key is configured, writes are impossible.
    #[error("no signing key configured")]
    NoSigner,
    /// Signing the transaction failed.
    #[error(transparent)]
    Signer(#[from] signer::SignerError),
    /// The transaction was mined but reverted.
    #[error("transaction {tx_hash} reverted")]
    Reverted {
        /// Hash of the transaction.
        tx_hash: String,
    },
    /// The transaction was not mined in time.
    #[error("transaction {tx_hash} not confirmed within {timeout:?}")]
    ConfirmationTimeout {
        /// Hash of the transaction.
        tx_hash: String,
        /// How long we waited.
        timeout: std::time::Duration,
    },
    /// The ledger is unavailable. Only produced by [`MemLedger`].
    #[error("ledger unavailable")]
    Unavailable,
}

impl LedgerError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Rpc(err) => err.is_transient(),
            LedgerError::Unavailable => true,
            _ => false,
        }
    }
}

/// The append-only, totally ordered registry event log.
pub trait EventSource: Send + Sync {
    /// Whether the node is still catching up with the chain.
    fn sync_status(&self) -> impl Future<Output = Result<SyncStatus, LedgerError>> + Send;

    /// The latest block number.
    fn head(&self) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// All events with the given first topic in the inclusive block range, in ascending
    /// position order.
    fn events(
        &self,
        topic: [u8; 32],
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = Result<Vec<RawEvent>, LedgerError>> + Send;
}

/// Paginated reads of a publisher's entries.
pub trait RegistryReader: Send + Sync {
    /// Number of entries ever published by `publisher`.
    fn count(&self, publisher: &Address) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Entries `offset..offset + limit` of `publisher`, in ascending entry id order.
    fn page(
        &self,
        publisher: &Address,
        offset: u64,
        limit: u64,
    ) -> impl Future<Output = Result<Vec<crate::RegistryEntry>, LedgerError>> + Send;
}

/// Appends entries to the registry.
pub trait RegistryWriter: Send + Sync {
    /// Append `(domain, path, content_address)` and wait for confirmation.
    fn submit(
        &self,
        domain: &str,
        path: &str,
        content_address: &str,
    ) -> impl Future<Output = Result<Confirmation, LedgerError>> + Send;
}
