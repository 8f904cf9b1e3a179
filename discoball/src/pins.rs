//! Local replication state, one record per content address.

use std::{collections::HashMap, time::SystemTime};

/// State of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PinStatus {
    /// An attempt is in flight.
    Pending,
    /// The content is pinned.
    Pinned,
    /// The last attempt failed, a later run retries.
    Failed,
}

/// What we know about one content address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRecord {
    /// The pinned address.
    pub content_address: String,
    /// Current state.
    pub status: PinStatus,
    /// When the last attempt started.
    pub last_attempt: SystemTime,
    /// Entry that referenced the address first.
    pub source_entry_id: u64,
    /// Number of attempts made.
    pub attempts: u32,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
}

/// All pin records of a replicator.
#[derive(Debug, Clone, Default)]
pub struct PinTable {
    records: HashMap<String, PinRecord>,
}

impl PinTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The record of `content_address`.
    pub fn get(&self, content_address: &str) -> Option<&PinRecord> {
        self.records.get(content_address)
    }

    /// Whether `content_address` is known to be pinned.
    pub fn is_pinned(&self, content_address: &str) -> bool {
        self.get(content_address)
            .is_some_and(|r| r.status == PinStatus::Pinned)
    }

    fn record(&mut self, content_address: &str, entry_id: u64) -> &mut PinRecord {
        self.records
            .entry(content_address.to_string())
            .or_insert_with(|| PinRecord {
                content_address: content_address.to_string(),
                status: PinStatus::Pending,
                last_attempt: SystemTime::now(),
                source_entry_id: entry_id,
                attempts: 0,
                last_error: None,
            })
    }

    /// Start an attempt. Creates the record on first sight.
    ///
    /// Does nothing for a pinned address.
    pub fn begin(&mut self, content_address: &str, entry_id: u64) {
        let record = self.record(content_address, entry_id);
        if record.status == PinStatus::Pinned {
            return;
        }
        record.status = PinStatus::Pending;
        record.last_attempt = SystemTime::now();
        record.attempts += 1;
    }

    /// Record a successful pin, also for content found pinned already.
    pub fn mark_pinned(&mut self, content_address: &str, entry_id: u64) {
        let record = self.record(content_address, entry_id);
        record.attempts = record.attempts.max(1);
        record.status = PinStatus::Pinned;
        record.last_error = None;
    }

    /// Record a failed attempt.
    pub fn mark_failed(&mut self, content_address: &str, error: impl ToString) {
        if let Some(record) = self.records.get_mut(content_address) {
            if record.status == PinStatus::Pending {
                record.status = PinStatus::Failed;
                record.last_error = Some(error.to_string());
            }
        }
    }

    /// Turn attempts left pending by an interrupted run into failures, so they are retried.
    pub fn fail_pending(&mut self) {
        for record in self.records.values_mut() {
            if record.status == PinStatus::Pending {
                record.status = PinStatus::Failed;
                record.last_error = Some("interrupted".to_string());
            }
        }
    }

    /// Number of records in `status`.
    pub fn count(&self, status: PinStatus) -> usize {
        self.records.values().filter(|r| r.status == status).count()
    }

    /// All records, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &PinRecord> {
        self.records.values()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let mut table = PinTable::new();
        table.begin("QmA", 1);
        assert_eq!(table.get("QmA").unwrap().status, PinStatus::Pending);
        table.mark_failed("QmA", "boom");
        let record = table.get("QmA").unwrap();
        assert_eq!(record.status, PinStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("boom"));

        table.begin("QmA", 7);
        table.mark_pinned("QmA", 7);
        let record = table.get("QmA").unwrap();
        assert_eq!(record.status, PinStatus::Pinned);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.source_entry_id, 1);
    }

    #[test]
    fn pinned_is_sticky() {
        let mut table = PinTable::new();
        table.mark_pinned("QmA", 1);
        table.begin("QmA", 2);
        table.mark_failed("QmA", "late failure");
        assert!(table.is_pinned("QmA"));
        assert_eq!(table.get("QmA").unwrap().attempts, 1);
        assert_eq!(PinStatus::Pinned.to_string(), "pinned");
    }

    #[test]
    fn interrupted_attempts_become_failures() {
        let mut table = PinTable::new();
        table.begin("QmA", 1);
        table.mark_pinned("QmB", 2);
        table.fail_pending();
        assert_eq!(table.count(PinStatus::Failed), 1);
        assert_eq!(table.count(PinStatus::Pinned), 1);
        assert_eq!(table.count(PinStatus::Pending), 0);
    }
}
