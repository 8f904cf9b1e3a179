//! Page snapshots.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// User agent sent with every crawl.
pub const USER_AGENT: &str = "DiscoBall-Mirror/1.0 (+https://github.com/pierce403/discoball)";

/// Default timeout for fetching a page.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));
static META_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid regex"));
static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\b([a-z-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});

/// Errors crawling a page.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// The request failed or returned an error status.
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        /// The crawled url.
        url: String,
        /// The http error.
        #[source]
        source: reqwest::Error,
    },
    /// No such page. Only produced by [`StaticCrawler`].
    #[error("{url} not found")]
    NotFound {
        /// The crawled url.
        url: String,
    },
    /// The request did not complete in time.
    #[error("fetching {url} timed out after {timeout:?}")]
    Timeout {
        /// The crawled url.
        url: String,
        /// The timeout that expired.
        timeout: Duration,
    },
}

/// Metadata extracted from the page head.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Contents of `<title>`.
    pub title: String,
    /// `<meta name="description">`.
    pub description: String,
    /// `<meta name="keywords">`.
    pub keywords: String,
}

/// A snapshot of one page, the document stored in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The crawled url.
    pub url: String,
    /// Domain part.
    pub domain: String,
    /// Path part.
    pub path: String,
    /// Crawl time, seconds since the unix epoch.
    pub timestamp: u64,
    /// Response content type.
    pub content_type: String,
    /// Response status code.
    pub status_code: u16,
    /// The page body.
    pub html: String,
    /// Extracted metadata.
    pub metadata: Metadata,
}

impl Snapshot {
    /// Build a snapshot from a fetched page.
    pub fn new(
        domain: &str,
        path: &str,
        content_type: String,
        status_code: u16,
        html: String,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let metadata = Metadata {
            title: title(&html),
            description: meta_content(&html, "description"),
            keywords: meta_content(&html, "keywords"),
        };
        Self {
            url: page_url(domain, path),
            domain: domain.to_string(),
            path: path.to_string(),
            timestamp,
            content_type,
            status_code,
            html,
            metadata,
        }
    }

    /// The document to store.
    pub fn to_document(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).expect("snapshot serializes")
    }
}

/// The url crawled for `domain` and `path`.
pub fn page_url(domain: &str, path: &str) -> String {
    format!("https://{domain}{path}")
}

fn title(html: &str) -> String {
    TITLE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

fn meta_content(html: &str, name: &str) -> String {
    for tag in META_TAG.find_iter(html) {
        let mut tag_name = None;
        let mut content = None;
        for attr in ATTRIBUTE.captures_iter(tag.as_str()) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match attr[1].to_ascii_lowercase().as_str() {
                "name" => tag_name = Some(value),
                "content" => content = Some(value),
                _ => {}
            }
        }
        if tag_name.is_some_and(|n| n.eq_ignore_ascii_case(name)) {
            return content.unwrap_or_default().to_string();
        }
    }
    String::new()
}

/// Produces snapshots of pages.
pub trait Crawler: Send + Sync {
    /// Snapshot `path` on `domain`.
    fn crawl(
        &self,
        domain: &str,
        path: &str,
    ) -> impl Future<Output = Result<Snapshot, CrawlError>> + Send;
}

/// A [`Crawler`] fetching pages over https.
#[derive(Debug, Clone)]
pub struct HttpCrawler {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpCrawler {
    /// Create a crawler with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { http, timeout })
    }
}

impl Crawler for HttpCrawler {
    async fn crawl(&self, domain: &str, path: &str) -> Result<Snapshot, CrawlError> {
        let url = page_url(domain, path);
        info!(%url, "crawling");
        let fetch = async {
            let response = self.http.get(&url).send().await?.error_for_status()?;
            let status_code = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("text/html")
                .to_string();
            let html = response.text().await?;
            Ok((status_code, content_type, html))
        };
        let (status_code, content_type, html) = tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| CrawlError::Timeout {
                url: url.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| CrawlError::Fetch {
                url: url.clone(),
                source,
            })?;
        let snapshot = Snapshot::new(domain, path, content_type, status_code, html);
        info!(%url, chars = snapshot.html.len(), "crawled");
        Ok(snapshot)
    }
}

/// A [`Crawler`] serving fixed pages, counting requests.
#[derive(Debug, Clone, Default)]
pub struct StaticCrawler {
    pages: HashMap<String, String>,
    requests: Arc<AtomicU64>,
}

impl StaticCrawler {
    /// A crawler without pages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `html` for `domain` and `path`.
    pub fn with_page(mut self, domain: &str, path: &str, html: impl Into<String>) -> Self {
        self.pages.insert(page_url(domain, path), html.into());
        self
    }

    /// Number of crawls so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl Crawler for StaticCrawler {
    async fn crawl(&self, domain: &str, path: &str) -> Result<Snapshot, CrawlError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let url = page_url(domain, path);
        match self.pages.get(&url) {
            Some(html) => Ok(Snapshot::new(
                domain,
                path,
                "text/html".to_string(),
                200,
                html.clone(),
            )),
            None => Err(CrawlError::NotFound { url }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html><head>
  <TITLE> Disco Ball </TITLE>
  <meta charset="utf-8">
  <meta content="mirrors, ipfs" name="keywords">
  <meta name='description' content='A mirror of a site'>
</head><body>hi</body></html>"#;

    #[test]
    fn extracts_metadata() {
        let snapshot = Snapshot::new("example.com", "/", "text/html".into(), 200, PAGE.into());
        assert_eq!(snapshot.url, "https://example.com/");
        assert_eq!(
            snapshot.metadata,
            Metadata {
                title: "Disco Ball".into(),
                description: "A mirror of a site".into(),
                keywords: "mirrors, ipfs".into(),
            }
        );
    }

    #[test]
    fn missing_metadata_is_empty() {
        let snapshot = Snapshot::new("example.com", "/x", "text/html".into(), 200, "<p>".into());
        assert_eq!(snapshot.metadata, Metadata::default());
        let doc: serde_json::Value = serde_json::from_slice(&snapshot.to_document()).unwrap();
        assert_eq!(doc["path"], "/x");
        assert_eq!(doc["metadata"]["title"], "");
    }
}
