//! JSON-RPC client for an Ethereum compatible node.
//!
//! Every request is bounded by the client's timeout. Errors are classified so the watcher can
//! tell a flaky connection, which is worth retrying, from a request the node will never accept.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;
use url::Url;

use crate::address::Address;

/// Default timeout for a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors talking to the node.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The request did not complete in time.
    #[error("{method} timed out after {timeout:?}")]
    Timeout {
        /// The method called.
        method: String,
        /// The timeout that expired.
        timeout: Duration,
    },
    /// Connection level failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The endpoint answered with a non-success HTTP status.
    #[error("{method} failed with http status {status}")]
    Status {
        /// The method called.
        method: String,
        /// The HTTP status code.
        status: u16,
    },
    /// The node returned a JSON-RPC error object.
    #[error("{method} failed: {message} (code {code})")]
    Rpc {
        /// The method called.
        method: String,
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the node.
        message: String,
    },
    /// The response could not be interpreted.
    #[error("invalid response to {method}: {reason}")]
    Invalid {
        /// The method called.
        method: String,
        /// What was wrong.
        reason: String,
    },
}

impl RpcError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Timeout { .. } | RpcError::Transport(_) => true,
            RpcError::Status { status, .. } => *status == 429 || *status >= 500,
            // -32005 is the de facto "limit exceeded" code used by hosted nodes
            RpcError::Rpc { code, .. } => *code == -32005,
            RpcError::Invalid { .. } => false,
        }
    }

    fn invalid(method: &str, reason: impl ToString) -> Self {
        RpcError::Invalid {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Request<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Value,
    error: Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

/// Sync state reported by `eth_syncing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The node is caught up with the chain.
    Synced,
    /// The node is still importing blocks.
    Syncing {
        /// Block the node has imported up to.
        current_block: u64,
        /// Highest block the node knows about.
        highest_block: u64,
    },
}

/// A log entry returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Hex encoded non-indexed data.
    pub data: String,
    /// Hex encoded topics.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Block number, absent for pending logs.
    pub block_number: Option<String>,
    /// Log index within the block, absent for pending logs.
    pub log_index: Option<String>,
    /// Hash of the emitting transaction.
    pub transaction_hash: Option<String>,
    /// Set when the log was removed by a reorganisation.
    #[serde(default)]
    pub removed: bool,
}

/// A mined transaction receipt, reduced to the fields we use.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// Hash of the transaction.
    pub transaction_hash: String,
    /// Block the transaction was included in.
    pub block_number: Option<String>,
    /// `0x1` on success, `0x0` when reverted.
    pub status: Option<String>,
}

/// Parse a hex quantity such as `0x1a`.
pub fn parse_quantity(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x")?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Parse a hex quantity that may exceed 64 bits, such as a gas price.
pub fn parse_quantity_u128(s: &str) -> Option<u128> {
    let digits = s.strip_prefix("0x")?;
    if digits.is_empty() {
        return None;
    }
    u128::from_str_radix(digits, 16).ok()
}

/// Format a hex quantity.
pub fn quantity(n: u64) -> String {
    format!("{n:#x}")
}

/// Decode hex data with `0x` prefix.
pub fn parse_data(s: &str) -> Option<Vec<u8>> {
    hex::decode(s.strip_prefix("0x")?).ok()
}

/// Client for the node's JSON-RPC endpoint.
#[derive(Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    url: Url,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Create a client for `url` with the given per-request timeout.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            url,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// The endpoint this client talks to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Perform a call and deserialize its result.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        trace!(id, method, "rpc request");
        let send = async {
            let response = self.http.post(self.url.clone()).json(&request).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(RpcError::Status {
                    method: method.to_string(),
                    status: status.as_u16(),
                });
            }
            let body: Response = response.json().await?;
            Ok(body)
        };
        let body = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| RpcError::Timeout {
                method: method.to_string(),
                timeout: self.timeout,
            })??;
        if let Some(err) = body.error {
            return Err(RpcError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }
        serde_json::from_value(body.result).map_err(|err| RpcError::invalid(method, err))
    }

    /// `eth_syncing`.
    pub async fn syncing(&self) -> Result<SyncStatus, RpcError> {
        let method = "eth_syncing";
        let value: Value = self.call(method, json!([])).await?;
        match value {
            Value::Bool(false) => Ok(SyncStatus::Synced),
            Value::Object(map) => {
                let field = |name: &str| {
                    map.get(name)
                        .and_then(Value::as_str)
                        .and_then(parse_quantity)
                        .ok_or_else(|| RpcError::invalid(method, format!("missing {name}")))
                };
                Ok(SyncStatus::Syncing {
                    current_block: field("currentBlock")?,
                    highest_block: field("highestBlock")?,
                })
            }
            other => Err(RpcError::invalid(method, format!("unexpected {other}"))),
        }
    }

    /// `eth_blockNumber`.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.quantity_call("eth_blockNumber", json!([])).await
    }

    /// `eth_chainId`.
    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        self.quantity_call("eth_chainId", json!([])).await
    }

    /// `eth_gasPrice`, in wei.
    pub async fn gas_price(&self) -> Result<u128, RpcError> {
        let method = "eth_gasPrice";
        let value: String = self.call(method, json!([])).await?;
        parse_quantity_u128(&value).ok_or_else(|| RpcError::invalid(method, value))
    }

    /// `eth_getTransactionCount` against the pending block, the next usable nonce.
    pub async fn transaction_count(&self, address: &Address) -> Result<u64, RpcError> {
        self.quantity_call(
            "eth_getTransactionCount",
            json!([address.to_lower_hex(), "pending"]),
        )
        .await
    }

    /// `eth_getLogs` for one contract and first topic over an inclusive block range.
    pub async fn logs(
        &self,
        contract: &Address,
        topic: &[u8; 32],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, RpcError> {
        let filter = json!({
            "address": contract.to_lower_hex(),
            "fromBlock": quantity(from_block),
            "toBlock": quantity(to_block),
            "topics": [format!("0x{}", hex::encode(topic))],
        });
        self.call("eth_getLogs", json!([filter])).await
    }

    /// `eth_call` against the latest block.
    pub async fn eth_call(&self, to: &Address, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let method = "eth_call";
        let call = json!({
            "to": to.to_lower_hex(),
            "data": format!("0x{}", hex::encode(data)),
        });
        let value: String = self.call(method, json!([call, "latest"])).await?;
        parse_data(&value).ok_or_else(|| RpcError::invalid(method, "result is not hex data"))
    }

    /// `eth_sendRawTransaction`, returns the transaction hash.
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, RpcError> {
        self.call(
            "eth_sendRawTransaction",
            json!([format!("0x{}", hex::encode(raw))]),
        )
        .await
    }

    /// `eth_getTransactionReceipt`, `None` while the transaction is not mined.
    pub async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, RpcError> {
        self.call("eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }

    async fn quantity_call(&self, method: &str, params: Value) -> Result<u64, RpcError> {
        let value: String = self.call(method, params).await?;
        parse_quantity(&value).ok_or_else(|| RpcError::invalid(method, value))
    }
}
