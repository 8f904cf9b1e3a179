use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Confirmation, EventSource, LedgerError, RawEvent, RegistryReader, RegistryWriter};
use crate::{
    abi::{self, AbiError, Decoder, Token, WORD_SIZE},
    address::Address,
    entry::{EventPosition, RegistryEntry},
    rpc::{parse_data, parse_quantity, RpcClient, SyncStatus},
    signer::{LegacyTransaction, SecretKey},
};

const PUBLISH_MIRROR: &str = "publishMirror(string,string,string)";
const ENTRY_COUNT: &str = "getEntryCountByPublisher(address)";
const ENTRIES: &str = "getEntriesByPublisher(address,uint256,uint256)";

/// Gas limit for `publishMirror`, generous for three short strings.
const GAS_LIMIT: u64 = 500_000;

/// Default time to wait for a transaction to be mined.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The registry contract, accessed through a node's JSON-RPC endpoint.
#[derive(derive_more::Debug)]
pub struct RpcLedger {
    rpc: RpcClient,
    contract: Address,
    #[debug("{:?}", signer.as_ref().map(SecretKey::address))]
    signer: Option<SecretKey>,
    chain_id: Option<u64>,
    confirmation_timeout: Duration,
}

impl RpcLedger {
    /// Access the registry contract at `contract`.
    pub fn new(rpc: RpcClient, contract: Address) -> Self {
        Self {
            rpc,
            contract,
            signer: None,
            chain_id: None,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }

    /// Sign writes with `key`.
    pub fn with_signer(mut self, key: SecretKey) -> Self {
        self.signer = Some(key);
        self
    }

    /// Use a fixed chain id instead of asking the node.
    pub fn with_chain_id(mut self, chain_id: Option<u64>) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// How long [`RegistryWriter::submit`] waits for the transaction to be mined.
    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Address of the registry contract.
    pub fn contract(&self) -> &Address {
        &self.contract
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<Confirmation, LedgerError> {
        let deadline = Instant::now() + self.confirmation_timeout;
        loop {
            match self.rpc.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status.as_deref() != Some("0x1") {
                        return Err(LedgerError::Reverted {
                            tx_hash: tx_hash.to_string(),
                        });
                    }
                    let block = receipt
                        .block_number
                        .as_deref()
                        .and_then(parse_quantity)
                        .unwrap_or_default();
                    return Ok(Confirmation {
                        tx_hash: receipt.transaction_hash,
                        block,
                    });
                }
                Ok(None) => debug!(tx_hash, "not mined yet"),
                Err(err) if err.is_transient() => debug!(tx_hash, "receipt poll failed: {err}"),
                Err(err) => return Err(err.into()),
            }
            if Instant::now() >= deadline {
                return Err(LedgerError::ConfirmationTimeout {
                    tx_hash: tx_hash.to_string(),
                    timeout: self.confirmation_timeout,
                });
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

impl EventSource for RpcLedger {
    async fn sync_status(&self) -> Result<SyncStatus, LedgerError> {
        Ok(self.rpc.syncing().await?)
    }

    async fn head(&self) -> Result<u64, LedgerError> {
        Ok(self.rpc.block_number().await?)
    }

    async fn events(
        &self,
        topic: [u8; 32],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>, LedgerError> {
        let logs = self
            .rpc
            .logs(&self.contract, &topic, from_block, to_block)
            .await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed {
                debug!(tx = ?log.transaction_hash, "ignoring removed log");
                continue;
            }
            let position = match (
                log.block_number.as_deref().and_then(parse_quantity),
                log.log_index.as_deref().and_then(parse_quantity),
            ) {
                (Some(block), Some(log_index)) => EventPosition::new(block, log_index),
                _ => {
                    debug!(tx = ?log.transaction_hash, "ignoring pending log");
                    continue;
                }
            };
            let Some(data) = parse_data(&log.data) else {
                warn!(%position, "skipping log with undecodable data");
                continue;
            };
            events.push(RawEvent { position, data });
        }
        events.sort_by_key(|event| event.position);
        Ok(events)
    }
}

impl RegistryReader for RpcLedger {
    async fn count(&self, publisher: &Address) -> Result<u64, LedgerError> {
        let data = abi::encode_call(ENTRY_COUNT, &[Token::Address(*publisher)]);
        let result = self.rpc.eth_call(&self.contract, &data).await?;
        Ok(Decoder::new(&result).uint(0)?)
    }

    async fn page(
        &self,
        publisher: &Address,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RegistryEntry>, LedgerError> {
        let data = abi::encode_call(
            ENTRIES,
            &[
                Token::Address(*publisher),
                Token::Uint(offset),
                Token::Uint(limit),
            ],
        );
        let result = self.rpc.eth_call(&self.contract, &data).await?;
        Ok(decode_entries(&result)?)
    }
}

impl RegistryWriter for RpcLedger {
    async fn submit(
        &self,
        domain: &str,
        path: &str,
        content_address: &str,
    ) -> Result<Confirmation, LedgerError> {
        let key = self.signer.as_ref().ok_or(LedgerError::NoSigner)?;
        let chain_id = match self.chain_id {
            Some(chain_id) => chain_id,
            None => self.rpc.chain_id().await?,
        };
        let nonce = self.rpc.transaction_count(&key.address()).await?;
        let gas_price = self.rpc.gas_price().await?;
        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit: GAS_LIMIT,
            to: self.contract,
            value: 0,
            data: abi::encode_call(
                PUBLISH_MIRROR,
                &[
                    Token::String(domain),
                    Token::String(path),
                    Token::String(content_address),
                ],
            ),
        };
        let raw = tx.sign(key, chain_id)?;
        let tx_hash = self.rpc.send_raw_transaction(&raw).await?;
        info!(%tx_hash, nonce, chain_id, "transaction sent");
        self.wait_for_receipt(&tx_hash).await
    }
}

/// Decode the `MirrorEntry[]` returned by `getEntriesByPublisher`.
fn decode_entries(data: &[u8]) -> Result<Vec<RegistryEntry>, AbiError> {
    let d = Decoder::new(data);
    let (len, heads) = d.array(0, 0)?;
    let mut entries = Vec::with_capacity(len);
    for i in 0..len {
        let tuple = d.offset(heads + i * WORD_SIZE, heads)?;
        entries.push(RegistryEntry {
            domain: d.string(tuple, tuple)?,
            path: d.string(tuple + WORD_SIZE, tuple)?,
            content_address: d.string(tuple + 2 * WORD_SIZE, tuple)?,
            publisher: d.address(tuple + 3 * WORD_SIZE)?,
            timestamp: d.uint(tuple + 4 * WORD_SIZE)?,
            entry_id: d.uint(tuple + 5 * WORD_SIZE)?,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(n: usize) -> Vec<u8> {
        abi::encode(&[Token::Uint(n as u64)])
    }

    fn encode_entries(entries: &[RegistryEntry]) -> Vec<u8> {
        let tuples: Vec<Vec<u8>> = entries
            .iter()
            .map(|e| {
                abi::encode(&[
                    Token::String(&e.domain),
                    Token::String(&e.path),
                    Token::String(&e.content_address),
                    Token::Address(e.publisher),
                    Token::Uint(e.timestamp),
                    Token::Uint(e.entry_id),
                ])
            })
            .collect();
        let mut out = word(WORD_SIZE);
        out.extend(word(entries.len()));
        let mut offset = entries.len() * WORD_SIZE;
        for tuple in &tuples {
            out.extend(word(offset));
            offset += tuple.len();
        }
        for tuple in tuples {
            out.extend(tuple);
        }
        out
    }

    #[test]
    fn decodes_entry_array() {
        let publisher: Address = "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB".parse().unwrap();
        let entries: Vec<RegistryEntry> = (0..3)
            .map(|i| RegistryEntry {
                entry_id: 10 + i,
                publisher,
                domain: "example.com".into(),
                path: format!("/page/{i}"),
                content_address: format!("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzd{i}"),
                timestamp: 1_700_000_000 + i,
            })
            .collect();
        let data = encode_entries(&entries);
        assert_eq!(decode_entries(&data).unwrap(), entries);
        assert_eq!(decode_entries(&encode_entries(&[])).unwrap(), vec![]);
    }

    #[test]
    fn truncated_entry_array_is_rejected() {
        let publisher: Address = "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB".parse().unwrap();
        let data = encode_entries(&[RegistryEntry {
            entry_id: 1,
            publisher,
            domain: "example.com".into(),
            path: "/".into(),
            content_address: "Qm".into(),
            timestamp: 0,
        }]);
        assert!(decode_entries(&data[..data.len() - 40]).is_err());
    }
}
