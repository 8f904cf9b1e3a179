//! Sync and replication for the discoball mirror registry.
//!
//! Publishers snapshot a page, store the snapshot in a content addressed store and append a
//! pointer to it to an on-chain registry. Friends discover those pointers and pin the content
//! locally. This crate contains both halves:
//!
//! - [`watcher`]: turns the registry's append-only event log into one ordered, deduplicated
//!   stream, replaying history first and then tailing new events.
//! - [`replicate`]: walks the entries of every trusted publisher page by page and pins the
//!   referenced content, idempotently.
//! - [`publish`]: verifies domain ownership, crawls a page, stores it and appends an entry.
//!
//! External systems are reached through narrow traits: [`ledger::EventSource`],
//! [`ledger::RegistryReader`], [`ledger::RegistryWriter`], [`store::ContentStore`],
//! [`dns::TxtResolver`] and [`crawl::Crawler`].

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod abi;
pub mod address;
pub mod crawl;
pub mod dns;
pub mod entry;
pub mod ledger;
pub mod pins;
pub mod publish;
pub mod replicate;
pub mod repository;
pub mod rpc;
pub mod signer;
pub mod store;
pub mod trust;
pub mod watcher;

pub use address::Address;
pub use entry::{EventPosition, MirrorEvent, RegistryEntry};
