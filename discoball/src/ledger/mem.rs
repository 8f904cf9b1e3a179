//! An in-memory registry.
//!
//! Behaves like the contract behind [`super::RpcLedger`]: every publish mines one block that
//! carries one `DiscoMsg` event. Failures and sync delays can be injected to exercise the
//! retry paths of the watcher and the replication loop.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{Confirmation, EventSource, LedgerError, RawEvent, RegistryReader, RegistryWriter};
use crate::{
    abi::event_topic,
    address::Address,
    entry::{EventPosition, MirrorEvent, RegistryEntry},
    rpc::SyncStatus,
};

/// In-memory registry. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemLedger {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    head: u64,
    entries: Vec<RegistryEntry>,
    events: Vec<RawEvent>,
    syncing_polls: u32,
    failures: u32,
    page_calls: Vec<(Address, u64, u64)>,
    writer: Option<Address>,
}

impl Inner {
    fn take_failure(&mut self) -> Result<(), LedgerError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(LedgerError::Unavailable);
        }
        Ok(())
    }

    fn append(&mut self, publisher: Address, domain: &str, path: &str, content: &str) -> RegistryEntry {
        self.head += 1;
        let entry = RegistryEntry {
            entry_id: self.entries.len() as u64,
            publisher,
            domain: domain.to_string(),
            path: path.to_string(),
            content_address: content.to_string(),
            timestamp: self.head * 12,
        };
        let event = MirrorEvent {
            entry_id: entry.entry_id,
            publisher,
            content_address: entry.content_address.clone(),
            description: entry.path.clone(),
        };
        self.events.push(RawEvent {
            position: EventPosition::new(self.head, 0),
            data: event.encode(),
        });
        self.entries.push(entry.clone());
        entry
    }
}

impl MemLedger {
    /// An empty registry at block 0.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("poisoned")
    }

    /// Publish an entry in a new block.
    pub fn publish(
        &self,
        publisher: Address,
        domain: &str,
        path: &str,
        content_address: &str,
    ) -> RegistryEntry {
        self.lock().append(publisher, domain, path, content_address)
    }

    /// Append an event with arbitrary data in a new block, without a matching entry.
    pub fn push_raw_event(&self, data: Vec<u8>) -> EventPosition {
        let mut inner = self.lock();
        inner.head += 1;
        let position = EventPosition::new(inner.head, 0);
        inner.events.push(RawEvent { position, data });
        position
    }

    /// Advance the head by `n` blocks without events.
    pub fn mine_empty(&self, n: u64) {
        self.lock().head += n;
    }

    /// Move the head back, as a reorganisation would.
    pub fn rewind_head(&self, head: u64) {
        self.lock().head = head;
    }

    /// The current head.
    pub fn head_block(&self) -> u64 {
        self.lock().head
    }

    /// Report syncing for the next `polls` sync status checks.
    pub fn set_syncing(&self, polls: u32) {
        self.lock().syncing_polls = polls;
    }

    /// Fail the next `n` calls with [`LedgerError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.lock().failures = n;
    }

    /// Every `(publisher, offset, limit)` page request served so far.
    pub fn page_calls(&self) -> Vec<(Address, u64, u64)> {
        self.lock().page_calls.clone()
    }

    /// Publisher used for entries written through [`RegistryWriter`].
    pub fn set_writer(&self, writer: Address) {
        self.lock().writer = Some(writer);
    }

    /// All entries, in commit order.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.lock().entries.clone()
    }
}

impl EventSource for MemLedger {
    async fn sync_status(&self) -> Result<SyncStatus, LedgerError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        if inner.syncing_polls > 0 {
            inner.syncing_polls -= 1;
            return Ok(SyncStatus::Syncing {
                current_block: inner.head,
                highest_block: inner.head + u64::from(inner.syncing_polls) + 1,
            });
        }
        Ok(SyncStatus::Synced)
    }

    async fn head(&self) -> Result<u64, LedgerError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        Ok(inner.head)
    }

    async fn events(
        &self,
        topic: [u8; 32],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>, LedgerError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        if topic != event_topic(MirrorEvent::SIGNATURE) {
            return Ok(Vec::new());
        }
        Ok(inner
            .events
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.position.block))
            .cloned()
            .collect())
    }
}

impl RegistryReader for MemLedger {
    async fn count(&self, publisher: &Address) -> Result<u64, LedgerError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.publisher == *publisher)
            .count() as u64)
    }

    async fn page(
        &self,
        publisher: &Address,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RegistryEntry>, LedgerError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        inner.page_calls.push((*publisher, offset, limit));
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.publisher == *publisher)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

impl RegistryWriter for MemLedger {
    async fn submit(
        &self,
        domain: &str,
        path: &str,
        content_address: &str,
    ) -> Result<Confirmation, LedgerError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        let writer = inner.writer.ok_or(LedgerError::NoSigner)?;
        let entry = inner.append(writer, domain, path, content_address);
        Ok(Confirmation {
            tx_hash: format!("0x{:064x}", entry.entry_id),
            block: inner.head,
        })
    }
}
