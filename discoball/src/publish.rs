//! The publish pipeline.
//!
//! Verify ownership of the domain, crawl the page, store the snapshot, then append one entry
//! to the registry. Each step must succeed before the next starts, so nothing reaches the
//! ledger unless the snapshot is stored.

use tracing::{info, instrument};

use crate::{
    address::Address,
    crawl::{CrawlError, Crawler},
    dns::{self, DnsError, TxtResolver},
    ledger::{LedgerError, RegistryWriter},
    store::{ContentStore, StoreError},
};

/// Steps of the pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PublishStep {
    /// Checking the request.
    Validate,
    /// Looking up TXT records.
    DnsLookup,
    /// Matching the ownership record.
    Verification,
    /// Fetching the page.
    Crawl,
    /// Storing the snapshot.
    Store,
    /// Appending the entry and waiting for confirmation.
    Submit,
}

/// Why publishing failed.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The domain or path is unusable.
    #[error("invalid target {domain:?}: {reason}")]
    InvalidTarget {
        /// The requested domain.
        domain: String,
        /// What is wrong.
        reason: &'static str,
    },
    /// TXT records could not be read.
    #[error(transparent)]
    DnsLookup(DnsError),
    /// The domain has no ownership record for the publisher.
    #[error("{domain} has no TXT record {expected:?}")]
    NotVerified {
        /// The domain.
        domain: String,
        /// The record that is missing.
        expected: String,
    },
    /// The page could not be fetched.
    #[error(transparent)]
    Crawl(CrawlError),
    /// The snapshot could not be stored.
    #[error("failed to store snapshot: {0}")]
    Store(#[source] StoreError),
    /// The registry write failed.
    #[error("failed to publish entry: {0}")]
    Submit(#[source] LedgerError),
}

impl PublishError {
    /// The step that failed.
    pub fn step(&self) -> PublishStep {
        match self {
            PublishError::InvalidTarget { .. } => PublishStep::Validate,
            PublishError::DnsLookup(_) => PublishStep::DnsLookup,
            PublishError::NotVerified { .. } => PublishStep::Verification,
            PublishError::Crawl(_) => PublishStep::Crawl,
            PublishError::Store(_) => PublishStep::Store,
            PublishError::Submit(_) => PublishStep::Submit,
        }
    }
}

/// A successfully published mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Mirrored domain.
    pub domain: String,
    /// Mirrored path.
    pub path: String,
    /// Where the snapshot is stored.
    pub content_address: String,
    /// Hash of the registry transaction.
    pub tx_hash: String,
    /// Block the entry was included in.
    pub block: u64,
}

/// Normalize a user supplied domain and path.
pub fn normalize_target(domain: &str, path: &str) -> Result<(String, String), PublishError> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid = |reason| PublishError::InvalidTarget {
        domain: domain.clone(),
        reason,
    };
    if domain.is_empty() {
        return Err(invalid("empty domain"));
    }
    if domain.contains("://") || domain.contains('/') || domain.contains(char::is_whitespace) {
        return Err(invalid("expected a bare domain name"));
    }
    let path = path.trim();
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    Ok((domain, path))
}

/// Runs the publish pipeline.
#[derive(Debug)]
pub struct PublishPipeline<D, C, S, W> {
    resolver: D,
    crawler: C,
    store: S,
    writer: W,
}

impl<D, C, S, W> PublishPipeline<D, C, S, W>
where
    D: TxtResolver,
    C: Crawler,
    S: ContentStore,
    W: RegistryWriter,
{
    /// Create a pipeline from its collaborators.
    pub fn new(resolver: D, crawler: C, store: S, writer: W) -> Self {
        Self {
            resolver,
            crawler,
            store,
            writer,
        }
    }

    /// Verify that `publisher` owns `domain`.
    pub async fn verify(&self, domain: &str, publisher: &Address) -> Result<(), PublishError> {
        let records = self
            .resolver
            .resolve_txt(domain)
            .await
            .map_err(PublishError::DnsLookup)?;
        let address = publisher.to_checksum();
        if !dns::is_verified(&records, &address) {
            return Err(PublishError::NotVerified {
                domain: domain.to_string(),
                expected: dns::expected_record(&address),
            });
        }
        info!(domain, "domain ownership verified");
        Ok(())
    }

    /// Mirror `domain` + `path` on behalf of `publisher`, the account behind the writer.
    #[instrument(skip(self), fields(%publisher))]
    pub async fn publish(
        &self,
        publisher: &Address,
        domain: &str,
        path: &str,
    ) -> Result<Published, PublishError> {
        let (domain, path) = normalize_target(domain, path)?;
        info!("starting mirror of {domain}{path}");

        self.verify(&domain, publisher).await?;

        let snapshot = self
            .crawler
            .crawl(&domain, &path)
            .await
            .map_err(PublishError::Crawl)?;

        let content_address = self
            .store
            .store(&snapshot.to_document())
            .await
            .map_err(PublishError::Store)?;
        info!(%content_address, "snapshot stored");

        let confirmation = self
            .writer
            .submit(&domain, &path, &content_address)
            .await
            .map_err(PublishError::Submit)?;
        info!(tx_hash = %confirmation.tx_hash, block = confirmation.block, "entry published");

        Ok(Published {
            domain,
            path,
            content_address,
            tx_hash: confirmation.tx_hash,
            block: confirmation.block,
        })
    }
}
