//! Paginated reads of a publisher's entries.
//!
//! A pass over a publisher pages up to the count observed when the pass started. Entries
//! appended during the pass are left for the next one, which keeps every pass finite and
//! deterministic. The registry is append-only; a pass that sees it shrink fails with
//! [`RepositoryError::AppendOnlyViolation`] instead of silently skipping entries.

use tracing::{debug, instrument, trace};

use crate::{
    address::Address,
    entry::RegistryEntry,
    ledger::{LedgerError, RegistryReader},
};

/// Default page size.
pub const DEFAULT_BATCH_SIZE: u64 = 50;

/// Largest entry count accepted from the registry for a single publisher.
pub const MAX_ENTRY_COUNT: u64 = 10_000_000;

/// Errors reading a publisher's entries.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The registry could not be read.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// The registry lost entries it had reported.
    #[error("registry is not append-only for {publisher}: {detail}")]
    AppendOnlyViolation {
        /// The publisher being read.
        publisher: Address,
        /// What was observed.
        detail: String,
    },
    /// The registry reported more entries than any publisher plausibly has.
    #[error("registry reported an implausible entry count {count} for {publisher}")]
    ImplausibleCount {
        /// The publisher being read.
        publisher: Address,
        /// The reported count.
        count: u64,
    },
    /// A page returned entries out of order or from another publisher.
    #[error("registry returned entry {entry_id} out of order for {publisher}")]
    OutOfOrder {
        /// The publisher being read.
        publisher: Address,
        /// The offending entry.
        entry_id: u64,
    },
}

/// The `(offset, limit)` pairs covering `count` entries in pages of `batch_size`.
///
/// The last page is clamped to the remainder.
pub fn page_plan(count: u64, batch_size: u64) -> impl Iterator<Item = (u64, u64)> {
    let batch_size = batch_size.max(1);
    (0..count)
        .step_by(batch_size as usize)
        .map(move |offset| (offset, batch_size.min(count - offset)))
}

/// Read side of the registry, one publisher at a time.
#[derive(Debug, Clone)]
pub struct EntryRepository<R> {
    reader: R,
    batch_size: u64,
}

impl<R: RegistryReader> EntryRepository<R> {
    /// Read through `reader` in pages of `batch_size` (at least 1).
    pub fn new(reader: R, batch_size: u64) -> Self {
        Self {
            reader,
            batch_size: batch_size.max(1),
        }
    }

    /// The page size.
    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Number of entries `publisher` has published.
    pub async fn count(&self, publisher: &Address) -> Result<u64, RepositoryError> {
        Ok(self.reader.count(publisher).await?)
    }

    /// All entries of `publisher` up to the count observed now, in ascending entry id order.
    #[instrument(skip_all, fields(%publisher))]
    pub async fn fetch_all(&self, publisher: &Address) -> Result<Vec<RegistryEntry>, RepositoryError> {
        let count = self.count(publisher).await?;
        if count > MAX_ENTRY_COUNT {
            return Err(RepositoryError::ImplausibleCount {
                publisher: *publisher,
                count,
            });
        }
        debug!(count, "fetching entries");
        let mut entries: Vec<RegistryEntry> = Vec::new();
        for (offset, limit) in page_plan(count, self.batch_size) {
            let mut page = self.reader.page(publisher, offset, limit).await?;
            trace!(offset, limit, got = page.len(), "page");
            if (page.len() as u64) < limit {
                let now = self.count(publisher).await?;
                let detail = if now < count {
                    format!("count shrank from {count} to {now}")
                } else {
                    format!(
                        "page at offset {offset} returned {} of {limit} entries",
                        page.len()
                    )
                };
                return Err(RepositoryError::AppendOnlyViolation {
                    publisher: *publisher,
                    detail,
                });
            }
            page.truncate(limit as usize);
            for entry in page {
                let in_order = entries
                    .last()
                    .map_or(true, |prev| entry.entry_id > prev.entry_id);
                if !in_order || entry.publisher != *publisher {
                    return Err(RepositoryError::OutOfOrder {
                        publisher: *publisher,
                        entry_id: entry.entry_id,
                    });
                }
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::ledger::MemLedger;

    fn alice() -> Address {
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap()
    }

    fn bob() -> Address {
        "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359".parse().unwrap()
    }

    #[test]
    fn plan_for_120_entries() {
        let plan: Vec<_> = page_plan(120, 50).collect();
        assert_eq!(plan, [(0, 50), (50, 50), (100, 20)]);
        assert_eq!(page_plan(0, 50).count(), 0);
        assert_eq!(page_plan(50, 50).collect::<Vec<_>>(), [(0, 50)]);
    }

    #[tokio::test]
    async fn fetches_in_three_pages() {
        let ledger = MemLedger::new();
        for i in 0..120 {
            ledger.publish(alice(), "example.com", &format!("/{i}"), &format!("Qm{i}"));
            ledger.publish(bob(), "example.org", "/", "QmBob");
        }
        let repo = EntryRepository::new(ledger.clone(), DEFAULT_BATCH_SIZE);
        let entries = repo.fetch_all(&alice()).await.unwrap();
        assert_eq!(entries.len(), 120);
        assert!(entries.iter().all(|e| e.publisher == alice()));
        assert_eq!(
            ledger.page_calls(),
            [(alice(), 0, 50), (alice(), 50, 50), (alice(), 100, 20)]
        );
    }

    #[tokio::test]
    async fn empty_publisher_is_not_an_error() {
        let ledger = MemLedger::new();
        let repo = EntryRepository::new(ledger.clone(), DEFAULT_BATCH_SIZE);
        assert!(repo.fetch_all(&alice()).await.unwrap().is_empty());
        assert!(ledger.page_calls().is_empty());
    }

    /// Serves short pages, as a registry that dropped entries would.
    #[derive(Debug)]
    struct Truncating {
        inner: MemLedger,
        count_after: Option<u64>,
    }

    impl RegistryReader for Truncating {
        async fn count(&self, publisher: &Address) -> Result<u64, LedgerError> {
            let count = self.inner.count(publisher).await?;
            if self.inner.page_calls().is_empty() {
                return Ok(count);
            }
            Ok(self.count_after.unwrap_or(count))
        }

        async fn page(
            &self,
            publisher: &Address,
            offset: u64,
            limit: u64,
        ) -> Result<Vec<RegistryEntry>, LedgerError> {
            let mut page = self.inner.page(publisher, offset, limit).await?;
            page.pop();
            Ok(page)
        }
    }

    #[tokio::test]
    async fn short_pages_violate_append_only() {
        let ledger = MemLedger::new();
        for i in 0..10 {
            ledger.publish(alice(), "example.com", "/", &format!("Qm{i}"));
        }
        let repo = EntryRepository::new(
            Truncating {
                inner: ledger.clone(),
                count_after: Some(9),
            },
            50,
        );
        match repo.fetch_all(&alice()).await {
            Err(RepositoryError::AppendOnlyViolation { detail, .. }) => {
                assert_eq!(detail, "count shrank from 10 to 9")
            }
            other => panic!("unexpected {other:?}"),
        }

        let repo = EntryRepository::new(
            Truncating {
                inner: MemLedger::new(),
                count_after: None,
            },
            50,
        );
        repo.reader.inner.publish(alice(), "example.com", "/", "Qm");
        let err = repo.fetch_all(&alice()).await.unwrap_err();
        assert!(err.to_string().contains("returned 0 of 1 entries"), "{err}");
    }

    /// Reports a count no registry could hold.
    #[derive(Debug)]
    struct Bloated(MemLedger);

    impl RegistryReader for Bloated {
        async fn count(&self, _publisher: &Address) -> Result<u64, LedgerError> {
            Ok(u64::MAX / 2)
        }

        async fn page(
            &self,
            publisher: &Address,
            offset: u64,
            limit: u64,
        ) -> Result<Vec<RegistryEntry>, LedgerError> {
            self.0.page(publisher, offset, limit).await
        }
    }

    #[tokio::test]
    async fn implausible_count_is_rejected() {
        let ledger = MemLedger::new();
        let repo = EntryRepository::new(Bloated(ledger.clone()), DEFAULT_BATCH_SIZE);
        match repo.fetch_all(&alice()).await {
            Err(RepositoryError::ImplausibleCount { count, .. }) => assert_eq!(count, u64::MAX / 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ledger.page_calls().is_empty());
    }

    proptest! {
        #[test]
        fn plan_covers_count_exactly(count in 0u64..1000, batch in 1u64..100) {
            let plan: Vec<_> = page_plan(count, batch).collect();
            let mut next = 0;
            for (offset, limit) in &plan {
                prop_assert_eq!(*offset, next);
                prop_assert!(*limit >= 1 && *limit <= batch);
                next += limit;
            }
            prop_assert_eq!(next, count);
            prop_assert_eq!(plan.len() as u64, count.div_ceil(batch));
        }

        #[test]
        fn fetch_all_returns_every_entry_in_order(count in 0u64..150, batch in 1u64..60) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let ledger = MemLedger::new();
            for i in 0..count {
                ledger.publish(alice(), "example.com", &format!("/{i}"), "Qm");
            }
            let repo = EntryRepository::new(ledger.clone(), batch);
            let entries = rt.block_on(repo.fetch_all(&alice())).unwrap();
            prop_assert_eq!(entries.len() as u64, count);
            prop_assert!(entries.windows(2).all(|w| w[0].entry_id < w[1].entry_id));
            prop_assert_eq!(ledger.page_calls().len() as u64, count.div_ceil(batch));
        }
    }
}
