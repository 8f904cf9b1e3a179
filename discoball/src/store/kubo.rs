//! Client for the HTTP RPC API of a Kubo (go-ipfs) node.

use std::{collections::HashMap, time::Duration};

use reqwest::multipart::{Form, Part};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, trace};
use url::Url;

use super::{ContentStore, StoreError, StoreStats};

/// The default API address of a local node.
pub const DEFAULT_API: &str = "/ip4/127.0.0.1/tcp/5001";

/// Default timeout for quick API calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for pinning, which may need to fetch the content from the network.
pub const DEFAULT_PIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Parse an API address, either a multiaddr like `/ip4/127.0.0.1/tcp/5001` or an http(s) url.
///
/// The returned url points at the `api/v0/` root.
pub fn parse_api_endpoint(s: &str) -> Result<Url, StoreError> {
    let invalid = || StoreError::InvalidEndpoint(s.to_string());
    let base = if s.starts_with("http://") || s.starts_with("https://") {
        let mut url = Url::parse(s).map_err(|_| invalid())?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url
    } else {
        let parts: Vec<&str> = s.split('/').collect();
        let (host, port, rest) = match parts.as_slice() {
            ["", proto, host, "tcp", port, rest @ ..] => {
                let host = match *proto {
                    "ip4" | "dns" | "dns4" | "dns6" => host.to_string(),
                    "ip6" => format!("[{host}]"),
                    _ => return Err(invalid()),
                };
                let port: u16 = port.parse().map_err(|_| invalid())?;
                (host, port, rest)
            }
            _ => return Err(invalid()),
        };
        let scheme = match rest {
            [] | ["http"] => "http",
            ["https"] | ["tls", "http"] => "https",
            _ => return Err(invalid()),
        };
        Url::parse(&format!("{scheme}://{host}:{port}/")).map_err(|_| invalid())?
    };
    if base.path().ends_with("/api/v0/") {
        Ok(base)
    } else {
        base.join("api/v0/").map_err(|_| invalid())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinLsResponse {
    #[serde(default)]
    keys: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RepoStat {
    repo_size: u64,
}

/// A [`ContentStore`] backed by a Kubo node.
#[derive(Debug, Clone)]
pub struct KuboStore {
    http: reqwest::Client,
    api: Url,
    timeout: Duration,
    pin_timeout: Duration,
}

impl KuboStore {
    /// Connect to the API at `endpoint`, see [`parse_api_endpoint`].
    pub fn new(endpoint: &str) -> Result<Self, StoreError> {
        let api = parse_api_endpoint(endpoint)?;
        let http = reqwest::Client::builder()
            .connect_timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api,
            timeout: DEFAULT_TIMEOUT,
            pin_timeout: DEFAULT_PIN_TIMEOUT,
        })
    }

    /// Set the timeouts for regular calls and for pinning.
    pub fn with_timeouts(mut self, timeout: Duration, pin_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.pin_timeout = pin_timeout;
        self
    }

    /// The `api/v0/` root this store talks to.
    pub fn api(&self) -> &Url {
        &self.api
    }

    async fn call<R: DeserializeOwned>(
        &self,
        op: &'static str,
        query: &[(&str, &str)],
        form: Option<Form>,
        timeout: Duration,
    ) -> Result<R, StoreError> {
        let url = self.api.join(op).map_err(|err| StoreError::Invalid {
            op,
            reason: err.to_string(),
        })?;
        trace!(%url, ?query, "store request");
        let mut request = self.http.post(url).query(query);
        if let Some(form) = form {
            request = request.multipart(form);
        }
        let send = async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ApiError>(&body)
                    .map(|e| e.message)
                    .unwrap_or_else(|_| format!("http status {status}"));
                return Err(StoreError::Api { op, message });
            }
            let body = response.bytes().await?;
            serde_json::from_slice(&body).map_err(|err| StoreError::Invalid {
                op,
                reason: err.to_string(),
            })
        };
        tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| StoreError::Timeout { op, timeout })?
    }
}

impl ContentStore for KuboStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let version: serde_json::Value = self.call("version", &[], None, self.timeout).await?;
        debug!(version = %version["Version"], "content store reachable");
        Ok(())
    }

    async fn store(&self, document: &[u8]) -> Result<String, StoreError> {
        let part = Part::bytes(document.to_vec())
            .file_name("snapshot.json")
            .mime_str("application/json")?;
        let form = Form::new().part("file", part);
        let added: AddResponse = self
            .call("add", &[("pin", "true")], Some(form), self.pin_timeout)
            .await?;
        Ok(added.hash)
    }

    async fn is_pinned(&self, content_address: &str) -> Result<bool, StoreError> {
        let res: Result<PinLsResponse, _> = self
            .call(
                "pin/ls",
                &[("arg", content_address), ("type", "recursive")],
                None,
                self.timeout,
            )
            .await;
        match res {
            Ok(pins) => Ok(!pins.keys.is_empty()),
            Err(StoreError::Api { message, .. }) if message.contains("not pinned") => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn pin(&self, content_address: &str) -> Result<(), StoreError> {
        let _: serde_json::Value = self
            .call("pin/add", &[("arg", content_address)], None, self.pin_timeout)
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let pins: PinLsResponse = self
            .call("pin/ls", &[("type", "recursive")], None, self.timeout)
            .await?;
        let repo: RepoStat = self.call("repo/stat", &[], None, self.timeout).await?;
        Ok(StoreStats {
            pinned_count: pins.keys.len() as u64,
            storage_bytes: repo.repo_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiaddrs() {
        let cases = [
            ("/ip4/127.0.0.1/tcp/5001", "http://127.0.0.1:5001/api/v0/"),
            ("/ip6/::1/tcp/5001", "http://[::1]:5001/api/v0/"),
            ("/dns/ipfs.example.com/tcp/8443/https", "https://ipfs.example.com:8443/api/v0/"),
            ("http://localhost:5001", "http://localhost:5001/api/v0/"),
            ("http://localhost:5001/api/v0", "http://localhost:5001/api/v0/"),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_api_endpoint(input).unwrap().as_str(), expected, "{input}");
        }
    }

    #[test]
    fn rejects_garbage() {
        for input in ["", "127.0.0.1:5001", "/ip4/127.0.0.1/udp/5001", "/ip4/127.0.0.1/tcp/x"] {
            assert!(parse_api_endpoint(input).is_err(), "{input}");
        }
    }
}
