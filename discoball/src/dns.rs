//! Domain ownership verification through DNS TXT records.
//!
//! A domain is owned by an account if one of its TXT records is exactly
//! `discoball-site-verification=<address>`, with the address in checksum encoding.

use std::{collections::HashMap, future::Future, time::Duration};

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    TokioAsyncResolver,
};
use tracing::debug;

/// Prefix of the ownership record.
pub const VERIFICATION_PREFIX: &str = "discoball-site-verification=";

/// Default timeout for a TXT lookup.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors resolving TXT records.
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    /// The resolver failed.
    #[error("dns lookup for {domain} failed: {source}")]
    Resolve {
        /// The queried domain.
        domain: String,
        /// The resolver error.
        #[source]
        source: ResolveError,
    },
    /// The lookup did not complete in time.
    #[error("dns lookup for {domain} timed out after {timeout:?}")]
    Timeout {
        /// The queried domain.
        domain: String,
        /// The timeout that expired.
        timeout: Duration,
    },
}

/// Something that can look up TXT records.
pub trait TxtResolver: Send + Sync {
    /// All TXT records of `domain`. A domain without TXT records yields an empty list.
    fn resolve_txt(&self, domain: &str)
        -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
}

/// The record that proves `address` owns a domain.
pub fn expected_record(address: &str) -> String {
    format!("{VERIFICATION_PREFIX}{address}")
}

/// Whether `records` contain the ownership record for `address`. Exact, case-sensitive match.
pub fn is_verified(records: &[String], address: &str) -> bool {
    let expected = expected_record(address);
    records.iter().any(|record| *record == expected)
}

/// A [`TxtResolver`] using the system's DNS configuration.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl DnsResolver {
    /// Create a resolver from the system configuration, falling back to public resolvers if
    /// the system configuration cannot be read.
    pub fn new(timeout: Duration) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            debug!("failed to read system dns config, using defaults: {err}");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver, timeout }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TxtResolver for DnsResolver {
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.txt_lookup(domain))
            .await
            .map_err(|_| DnsError::Timeout {
                domain: domain.to_string(),
                timeout: self.timeout,
            })?;
        match lookup {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect::<String>()
                })
                .collect()),
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Ok(Vec::new())
            }
            Err(source) => Err(DnsError::Resolve {
                domain: domain.to_string(),
                source,
            }),
        }
    }
}

/// A [`TxtResolver`] answering from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticTxt {
    records: HashMap<String, Vec<String>>,
}

impl StaticTxt {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the records of `domain`.
    pub fn with_records(
        mut self,
        domain: impl Into<String>,
        records: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.records
            .insert(domain.into(), records.into_iter().map(Into::into).collect());
        self
    }
}

impl TxtResolver for StaticTxt {
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        Ok(self.records.get(domain).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ownership_record_must_match_exactly() {
        let resolver = StaticTxt::new().with_records(
            "example.com",
            ["v=spf1 include:_spf.example.com ~all", "discoball-site-verification=0xABC"],
        );
        let records = resolver.resolve_txt("example.com").await.unwrap();
        assert!(is_verified(&records, "0xABC"));
        assert!(!is_verified(&records, "0xDEF"));
        // case-sensitive
        assert!(!is_verified(&records, "0xabc"));
        assert!(!is_verified(&[], "0xABC"));
    }

    #[tokio::test]
    async fn unknown_domain_has_no_records() {
        let records = StaticTxt::new().resolve_txt("nowhere.example").await.unwrap();
        assert!(records.is_empty());
    }
}
