//! The replication loop.
//!
//! For every publisher of a [`TrustSet`], the [`Replicator`] reads all entries through the
//! [`EntryRepository`] and makes sure every referenced content address is pinned in the
//! [`ContentStore`]. A run can be repeated at any time: addresses already pinned, either
//! according to the local [`PinTable`] or to the store itself, are not pinned again.
//!
//! Only an unreachable store at the start of a run is fatal. A failing publisher or a
//! failing pin is recorded in the [`ReplicationReport`] and the run moves on.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    address::Address,
    entry::RegistryEntry,
    ledger::RegistryReader,
    pins::PinTable,
    repository::{EntryRepository, DEFAULT_BATCH_SIZE},
    store::{ContentStore, StoreError},
    trust::TrustSet,
};

/// Replication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Entries requested per page.
    pub batch_size: u64,
    /// Pause after each pin request, to go easy on the store.
    #[serde(with = "humantime_serde")]
    pub pin_delay: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            pin_delay: Duration::from_millis(100),
        }
    }
}

/// Errors that abort a whole run.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The store could not be reached before anything was attempted.
    #[error("content store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

/// Result of pinning one entry's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinOutcome {
    /// Nothing to do, the content was pinned before.
    AlreadyPinned,
    /// The content was pinned by this request.
    Pinned,
    /// The pin request failed.
    Failed(String),
}

/// A pin that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinFailure {
    /// Entry referencing the content.
    pub entry_id: u64,
    /// The content address.
    pub content_address: String,
    /// Why it failed.
    pub error: String,
}

/// Outcome for one publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherReport {
    /// The publisher.
    pub publisher: Address,
    /// Entries found.
    pub total: u64,
    /// Entries pinned by this run.
    pub newly_pinned: u64,
    /// Entries whose content was pinned already.
    pub already_pinned: u64,
    /// Entries whose content could not be pinned.
    pub failed: Vec<PinFailure>,
    /// Set if the entries could not be read at all.
    pub error: Option<String>,
}

impl PublisherReport {
    fn new(publisher: Address) -> Self {
        Self {
            publisher,
            total: 0,
            newly_pinned: 0,
            already_pinned: 0,
            failed: Vec::new(),
            error: None,
        }
    }

    /// Entries whose content is pinned after this run.
    pub fn pinned(&self) -> u64 {
        self.newly_pinned + self.already_pinned
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    /// One report per publisher processed, in trust set order.
    pub publishers: Vec<PublisherReport>,
    /// Size of the trust set.
    pub trusted: usize,
    /// The run was cancelled before it completed.
    pub interrupted: bool,
}

impl ReplicationReport {
    /// Publishers with at least one pinned entry.
    pub fn successful_publishers(&self) -> usize {
        self.publishers.iter().filter(|p| p.pinned() > 0).count()
    }

    /// Entries pinned after this run, new and old.
    pub fn total_pins(&self) -> u64 {
        self.publishers.iter().map(PublisherReport::pinned).sum()
    }

    /// Entries pinned by this run.
    pub fn new_pins(&self) -> u64 {
        self.publishers.iter().map(|p| p.newly_pinned).sum()
    }

    /// Failed pins.
    pub fn failed_pins(&self) -> usize {
        self.publishers.iter().map(|p| p.failed.len()).sum()
    }

    /// Whether there was nothing to replicate.
    pub fn is_empty(&self) -> bool {
        self.trusted == 0
    }

    /// At least one publisher yielded a pin.
    pub fn is_success(&self) -> bool {
        self.successful_publishers() > 0
    }
}

impl fmt::Display for ReplicationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No trusted publishers, nothing to do.");
        }
        for p in &self.publishers {
            write!(f, "{}: {}/{} pinned", p.publisher, p.pinned(), p.total)?;
            if !p.failed.is_empty() {
                write!(f, ", {} failed", p.failed.len())?;
            }
            if let Some(err) = &p.error {
                write!(f, ", error: {err}")?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            "Friends processed: {}/{} with pins",
            self.successful_publishers(),
            self.trusted
        )?;
        writeln!(f, "Total pins: {} ({} new)", self.total_pins(), self.new_pins())?;
        if self.failed_pins() > 0 {
            writeln!(f, "Failed pins: {}", self.failed_pins())?;
        }
        if self.interrupted {
            writeln!(f, "Interrupted before completion.")?;
        }
        Ok(())
    }
}

/// Make sure `content_address`, referenced by entry `entry_id`, is pinned in `store`.
///
/// Consults `pins` first, then the store, and only then issues a pin request.
pub async fn pin_content<S: ContentStore>(
    store: &S,
    pins: &mut PinTable,
    content_address: &str,
    entry_id: u64,
) -> PinOutcome {
    if pins.is_pinned(content_address) {
        debug!(entry_id, content_address, "already pinned");
        return PinOutcome::AlreadyPinned;
    }
    match store.is_pinned(content_address).await {
        Ok(true) => {
            debug!(entry_id, content_address, "already pinned in store");
            pins.mark_pinned(content_address, entry_id);
            return PinOutcome::AlreadyPinned;
        }
        Ok(false) => {}
        Err(err) => debug!(content_address, "pin check failed, pinning anyway: {err}"),
    }
    info!(entry_id, content_address, "pinning");
    pins.begin(content_address, entry_id);
    match store.pin(content_address).await {
        Ok(()) => {
            pins.mark_pinned(content_address, entry_id);
            PinOutcome::Pinned
        }
        Err(err) => {
            warn!(entry_id, content_address, "pin failed: {err}");
            pins.mark_failed(content_address, &err);
            PinOutcome::Failed(err.to_string())
        }
    }
}

/// Pins the content of trusted publishers.
#[derive(Debug)]
pub struct Replicator<R, S> {
    repository: EntryRepository<R>,
    store: S,
    config: ReplicationConfig,
    pins: PinTable,
}

impl<R: RegistryReader, S: ContentStore> Replicator<R, S> {
    /// Create a replicator with an empty pin table.
    pub fn new(reader: R, store: S, config: ReplicationConfig) -> Self {
        Self {
            repository: EntryRepository::new(reader, config.batch_size),
            store,
            config,
            pins: PinTable::new(),
        }
    }

    /// Local pin state, kept across runs.
    pub fn pins(&self) -> &PinTable {
        &self.pins
    }

    /// The content store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replicate everything `trust` has published.
    ///
    /// Cancellation is checked between entries. A cancelled run returns the partial report
    /// with [`ReplicationReport::interrupted`] set.
    pub async fn run(
        &mut self,
        trust: &TrustSet,
        cancel: &CancellationToken,
    ) -> Result<ReplicationReport, ReplicationError> {
        let mut report = ReplicationReport {
            trusted: trust.len(),
            ..Default::default()
        };
        if trust.is_empty() {
            info!("no trusted publishers, nothing to do");
            return Ok(report);
        }
        self.store
            .ping()
            .await
            .map_err(ReplicationError::StoreUnavailable)?;
        info!(publishers = trust.len(), "starting replication");

        for (i, publisher) in trust.iter().enumerate() {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let span = info_span!("publisher", %publisher);
            let publisher_report = self.replicate(publisher, cancel).instrument(span).await;
            report.publishers.push(publisher_report);
            info!("Friends processed {}/{}", i + 1, trust.len());
        }
        if cancel.is_cancelled() {
            report.interrupted = true;
        }
        self.pins.fail_pending();
        info!(
            pins = report.total_pins(),
            new = report.new_pins(),
            failed = report.failed_pins(),
            "replication finished"
        );
        Ok(report)
    }

    async fn replicate(&mut self, publisher: &Address, cancel: &CancellationToken) -> PublisherReport {
        let mut report = PublisherReport::new(*publisher);
        let entries = match self.repository.fetch_all(publisher).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to read entries: {err}");
                report.error = Some(err.to_string());
                return report;
            }
        };
        report.total = entries.len() as u64;
        if entries.is_empty() {
            info!("no entries");
            return report;
        }
        info!(entries = entries.len(), "pinning entries");

        for entry in &entries {
            if cancel.is_cancelled() {
                debug!(entry_id = entry.entry_id, "cancelled");
                break;
            }
            debug!(entry_id = entry.entry_id, location = %entry.location(), "entry");
            match self.pin_entry(entry).await {
                PinOutcome::AlreadyPinned => report.already_pinned += 1,
                PinOutcome::Pinned => {
                    report.newly_pinned += 1;
                    self.throttle(cancel).await;
                }
                PinOutcome::Failed(error) => {
                    report.failed.push(PinFailure {
                        entry_id: entry.entry_id,
                        content_address: entry.content_address.clone(),
                        error,
                    });
                    self.throttle(cancel).await;
                }
            }
        }
        info!(
            pinned = report.pinned(),
            total = report.total,
            failed = report.failed.len(),
            "publisher done"
        );
        report
    }

    /// Make sure the content of `entry` is pinned.
    pub async fn pin_entry(&mut self, entry: &RegistryEntry) -> PinOutcome {
        pin_content(&self.store, &mut self.pins, &entry.content_address, entry.entry_id).await
    }

    async fn throttle(&self, cancel: &CancellationToken) {
        if self.config.pin_delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.pin_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        ledger::MemLedger,
        pins::PinStatus,
        store::MemStore,
    };

    fn alice() -> Address {
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap()
    }

    fn bob() -> Address {
        "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359".parse().unwrap()
    }

    fn config() -> ReplicationConfig {
        ReplicationConfig {
            batch_size: 2,
            pin_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failed_pin_does_not_abort_the_run() {
        let ledger = MemLedger::new();
        for i in 0..5 {
            ledger.publish(alice(), "example.com", &format!("/{i}"), &format!("Qm{i}"));
        }
        let store = MemStore::new();
        store.fail_pins_of("Qm2");
        let mut replicator = Replicator::new(ledger, store.clone(), config());

        let trust: TrustSet = [alice()].into_iter().collect();
        let report = replicator.run(&trust, &CancellationToken::new()).await.unwrap();
        let alice_report = &report.publishers[0];
        assert_eq!(alice_report.total, 5);
        assert_eq!(alice_report.newly_pinned, 4);
        assert_eq!(alice_report.failed.len(), 1);
        assert_eq!(alice_report.failed[0].content_address, "Qm2");
        assert!(report.is_success());
        assert_eq!(replicator.pins().get("Qm2").unwrap().status, PinStatus::Failed);
        assert!(logs_contain("pin failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn pinning_twice_is_a_no_op() {
        let ledger = MemLedger::new();
        let entry = ledger.publish(alice(), "example.com", "/", "QmA");
        let store = MemStore::new();
        let mut replicator = Replicator::new(ledger, store.clone(), config());

        assert_eq!(replicator.pin_entry(&entry).await, PinOutcome::Pinned);
        assert_eq!(replicator.pin_entry(&entry).await, PinOutcome::AlreadyPinned);
        assert_eq!(store.pin_requests(), 1);
        assert!(replicator.pins().is_pinned("QmA"));
    }

    #[tokio::test(start_paused = true)]
    async fn store_pins_are_trusted() {
        let ledger = MemLedger::new();
        let entry = ledger.publish(alice(), "example.com", "/", "QmA");
        let store = MemStore::new();
        store.pin("QmA").await.unwrap();
        let mut replicator = Replicator::new(ledger, store.clone(), config());

        assert_eq!(replicator.pin_entry(&entry).await, PinOutcome::AlreadyPinned);
        assert_eq!(store.pin_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_read_failure_is_reported() {
        let ledger = MemLedger::new();
        ledger.publish(bob(), "example.org", "/", "QmB");
        let store = MemStore::new();
        let mut replicator = Replicator::new(ledger.clone(), store, config());
        let trust: TrustSet = [alice(), bob()].into_iter().collect();

        ledger.fail_next(1);
        let report = replicator.run(&trust, &CancellationToken::new()).await.unwrap();
        assert!(report.publishers[0].error.is_some());
        assert_eq!(report.publishers[1].newly_pinned, 1);
        assert_eq!(report.successful_publishers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_pins_nothing() {
        let ledger = MemLedger::new();
        for i in 0..4 {
            ledger.publish(alice(), "example.com", "/", &format!("Qm{i}"));
        }
        let store = MemStore::new();
        let mut replicator = Replicator::new(ledger, store.clone(), config());
        let trust: TrustSet = [alice()].into_iter().collect();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = replicator.run(&trust, &cancel).await.unwrap();
        assert!(report.interrupted);
        assert!(report.publishers.is_empty());
        assert_eq!(store.pin_requests(), 0);
        assert_eq!(replicator.pins().count(PinStatus::Pending), 0);
    }

    /// Cancels `cancel` while serving the `after`th pin request.
    #[derive(Debug)]
    struct CancelOnPin {
        inner: MemStore,
        after: u32,
        pins: std::sync::atomic::AtomicU32,
        cancel: CancellationToken,
    }

    impl ContentStore for CancelOnPin {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn store(&self, document: &[u8]) -> Result<String, StoreError> {
            self.inner.store(document).await
        }

        async fn is_pinned(&self, content_address: &str) -> Result<bool, StoreError> {
            self.inner.is_pinned(content_address).await
        }

        async fn pin(&self, content_address: &str) -> Result<(), StoreError> {
            let n = self.pins.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if n == self.after {
                self.cancel.cancel();
            }
            self.inner.pin(content_address).await
        }

        async fn stats(&self) -> Result<crate::store::StoreStats, StoreError> {
            self.inner.stats().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_entries() {
        let ledger = MemLedger::new();
        for i in 0..4 {
            ledger.publish(alice(), "alice.example", "/", &format!("QmA{i}"));
            ledger.publish(bob(), "bob.example", "/", &format!("QmB{i}"));
        }
        let cancel = CancellationToken::new();
        let inner = MemStore::new();
        let store = CancelOnPin {
            inner: inner.clone(),
            after: 2,
            pins: Default::default(),
            cancel: cancel.clone(),
        };
        let mut replicator = Replicator::new(ledger, store, config());
        let trust: TrustSet = [alice(), bob()].into_iter().collect();

        let report = replicator.run(&trust, &cancel).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.publishers.len(), 1);
        assert_eq!(report.publishers[0].newly_pinned, 2);
        assert_eq!(inner.pin_requests(), 2);
        assert_eq!(
            inner.pinned().into_iter().collect::<Vec<_>>(),
            ["QmA0", "QmA1"]
        );
        let pins = replicator.pins();
        assert_eq!(pins.count(PinStatus::Pinned), 2);
        assert_eq!(pins.count(PinStatus::Pending), 0);
        assert!(pins.get("QmA2").is_none());
    }

    #[test]
    fn summary() {
        let report = ReplicationReport {
            publishers: vec![PublisherReport {
                publisher: alice(),
                total: 3,
                newly_pinned: 1,
                already_pinned: 1,
                failed: vec![PinFailure {
                    entry_id: 2,
                    content_address: "QmX".into(),
                    error: "boom".into(),
                }],
                error: None,
            }],
            trusted: 2,
            interrupted: false,
        };
        let text = report.to_string();
        assert!(text.contains("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed: 2/3 pinned, 1 failed"));
        assert!(text.contains("Friends processed: 1/2 with pins"));
        assert!(text.contains("Total pins: 2 (1 new)"));
        assert_eq!(
            ReplicationReport::default().to_string(),
            "No trusted publishers, nothing to do.\n"
        );
    }
}
