//! Registry data model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    abi::{self, AbiError, Decoder, Token},
    address::Address,
    ledger::RawEvent,
    watcher::{EventShape, MalformedEvent},
};

/// Position of an event in the ledger's total order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct EventPosition {
    /// Block number.
    pub block: u64,
    /// Index of the log within its block.
    pub log_index: u64,
}

impl EventPosition {
    /// Create a position.
    pub const fn new(block: u64, log_index: u64) -> Self {
        Self { block, log_index }
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.log_index)
    }
}

/// A mirror entry as stored by the registry. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Ledger assigned id, increasing in commit order.
    pub entry_id: u64,
    /// Account that submitted the entry.
    pub publisher: Address,
    /// Mirrored domain.
    pub domain: String,
    /// Mirrored path.
    pub path: String,
    /// Address of the stored snapshot.
    pub content_address: String,
    /// Ledger assigned creation time, seconds since the unix epoch.
    pub timestamp: u64,
}

impl RegistryEntry {
    /// `domain` and `path` joined, the way they are shown to users.
    pub fn location(&self) -> String {
        format!("{}{}", self.domain, self.path)
    }
}

/// Payload of the registry's `DiscoMsg` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorEvent {
    /// The running entry count at the time of publishing, used as entry id.
    pub entry_id: u64,
    /// Account that published.
    pub publisher: Address,
    /// Address of the stored snapshot.
    pub content_address: String,
    /// Free form description, usually the mirrored path.
    pub description: String,
}

impl MirrorEvent {
    /// Solidity signature of the event.
    pub const SIGNATURE: &'static str = "DiscoMsg(address,string,string,uint256)";

    /// Decode the non-indexed event data.
    pub fn decode(data: &[u8]) -> Result<Self, AbiError> {
        let d = Decoder::new(data);
        let publisher = d.address(0)?;
        let content_address = d.string(abi::WORD_SIZE, 0)?;
        let description = d.string(2 * abi::WORD_SIZE, 0)?;
        let entry_id = d.uint(3 * abi::WORD_SIZE)?;
        Ok(Self {
            entry_id,
            publisher,
            content_address,
            description,
        })
    }

    /// Encode as event data.
    pub fn encode(&self) -> Vec<u8> {
        abi::encode(&[
            Token::Address(self.publisher),
            Token::String(&self.content_address),
            Token::String(&self.description),
            Token::Uint(self.entry_id),
        ])
    }
}

/// The registry event announcing a new mirror.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoMsg;

impl EventShape for DiscoMsg {
    type Payload = MirrorEvent;

    fn signature(&self) -> &'static str {
        MirrorEvent::SIGNATURE
    }

    fn decode(&self, event: &RawEvent) -> Result<MirrorEvent, MalformedEvent> {
        let payload = MirrorEvent::decode(&event.data)
            .map_err(|err| MalformedEvent::new(event.position, err))?;
        if payload.content_address.trim().is_empty() {
            return Err(MalformedEvent::new(
                event.position,
                "empty content address",
            ));
        }
        Ok(payload)
    }

    fn entry_id(&self, payload: &MirrorEvent) -> Option<u64> {
        Some(payload.entry_id)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn publisher() -> Address {
        "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359".parse().unwrap()
    }

    #[test]
    fn position_order() {
        assert!(EventPosition::new(1, 5) < EventPosition::new(2, 0));
        assert!(EventPosition::new(2, 0) < EventPosition::new(2, 1));
        assert_eq!(EventPosition::new(7, 3).to_string(), "7:3");
    }

    #[test]
    fn mirror_event_roundtrip() {
        let event = MirrorEvent {
            entry_id: 12,
            publisher: publisher(),
            content_address: "QmSV87hzPYKxo8Go7A2JCsfCVXPqV8poovGk9tFrVJmdNr".into(),
            description: "/index.html".into(),
        };
        assert_eq!(MirrorEvent::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn empty_content_address_is_malformed() {
        let event = MirrorEvent {
            entry_id: 1,
            publisher: publisher(),
            content_address: "".into(),
            description: "/".into(),
        };
        let raw = RawEvent {
            position: EventPosition::new(1, 0),
            data: event.encode(),
        };
        assert!(DiscoMsg.decode(&raw).is_err());
        assert!(DiscoMsg.decode(&RawEvent {
            position: EventPosition::new(1, 1),
            data: vec![1, 2, 3],
        })
        .is_err());
    }
}
