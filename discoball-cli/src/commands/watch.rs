use std::{
    ops::ControlFlow,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::Args;
use discoball::{
    entry::DiscoMsg,
    pins::PinTable,
    replicate::{self, PinOutcome},
    store::{ContentStore, KuboStore},
    trust::TrustSet,
    watcher::{Delivery, EventHandler, WatchCursor, WatchEvent, Watcher},
    MirrorEvent,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::Config;

/// Cursor file name in the data directory.
const CURSOR_FILE: &str = "watch-cursor.json";

#[derive(Args, Debug, Clone)]
pub(crate) struct WatchArgs {
    /// Pin the content of every event as it arrives.
    #[clap(long)]
    pub(crate) pin: bool,
    /// Only pin content of the publishers in this file.
    #[clap(long, requires = "pin")]
    pub(crate) friends_file: Option<PathBuf>,
    /// Replay from this block, ignoring the saved cursor.
    #[clap(long)]
    pub(crate) from_block: Option<u64>,
    /// Neither resume from nor save a cursor.
    #[clap(long)]
    pub(crate) no_cursor: bool,
}

/// Pins watched content, optionally only for trusted publishers.
struct Pinner<S> {
    store: S,
    pins: PinTable,
    trust: Option<TrustSet>,
    pinned: u64,
}

impl<S: ContentStore> Pinner<S> {
    async fn handle(&mut self, event: &MirrorEvent) {
        if let Some(trust) = &self.trust {
            if !trust.contains(&event.publisher) {
                return;
            }
        }
        let outcome = replicate::pin_content(
            &self.store,
            &mut self.pins,
            &event.content_address,
            event.entry_id,
        )
        .await;
        if let PinOutcome::Pinned = outcome {
            self.pinned += 1;
            println!("      pinned {}", event.content_address);
        }
    }
}

/// Prints every event and pins it if asked to, before the cursor moves past it.
struct Printer<S> {
    pinner: Option<Pinner<S>>,
}

impl<S: ContentStore> EventHandler<MirrorEvent> for Printer<S> {
    async fn handle(&mut self, event: WatchEvent<MirrorEvent>) -> ControlFlow<()> {
        print_event(&event);
        if let Some(pinner) = self.pinner.as_mut() {
            pinner.handle(&event.payload).await;
        }
        ControlFlow::Continue(())
    }
}

impl WatchArgs {
    pub(crate) async fn run(self, config: &Config, data_dir: &Path) -> Result<ExitCode> {
        let pinner = if self.pin {
            Some(self.pinner(config).await?)
        } else {
            None
        };
        let mut printer = Printer { pinner };

        let mut watcher = Watcher::new(config.ledger()?, DiscoMsg, config.watcher.clone())
            .start_at(self.from_block.unwrap_or(config.registry.start_block));
        if !self.no_cursor {
            tokio::fs::create_dir_all(data_dir)
                .await
                .with_context(|| format!("failed to create {}", data_dir.display()))?;
            let path = data_dir.join(CURSOR_FILE);
            if self.from_block.is_none() {
                if let Some(cursor) = WatchCursor::load(&path).await? {
                    info!(?cursor, "resuming");
                    watcher = watcher.with_cursor(cursor);
                }
            }
            watcher = watcher.persist_cursor(path);
        }

        let mut status = watcher.subscribe();
        let cancel = CancellationToken::new();
        let cursor = {
            let run = watcher
                .run(&mut printer, cancel.clone())
                .instrument(info_span!("watcher"));
            tokio::pin!(run);
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            let mut stopping = false;
            loop {
                tokio::select! {
                    _ = &mut ctrl_c, if !stopping => {
                        println!("Stopping...");
                        stopping = true;
                        cancel.cancel();
                    }
                    Ok(()) = status.changed(), if !stopping => {
                        info!(status = %*status.borrow_and_update(), "watcher status");
                    }
                    res = &mut run => break res?,
                }
            }
        };

        if let Some(last) = cursor.last_seen {
            info!(%last, "watcher stopped");
        }
        if let Some(pinner) = &printer.pinner {
            println!("Pinned {} new items", pinner.pinned);
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn pinner(&self, config: &Config) -> Result<Pinner<KuboStore>> {
        let store = config.store()?;
        store.ping().await.context("content store unavailable")?;
        let trust = match &self.friends_file {
            Some(path) => {
                let trust = TrustSet::load(path).await?;
                if trust.is_empty() {
                    warn!("no trusted publishers in {}, nothing will be pinned", path.display());
                }
                Some(trust)
            }
            None => None,
        };
        Ok(Pinner {
            store,
            pins: PinTable::new(),
            trust,
            pinned: 0,
        })
    }
}

fn print_event(event: &WatchEvent<MirrorEvent>) {
    let label = match event.delivery {
        Delivery::CatchUp => "old",
        Delivery::Live => "new",
    };
    let MirrorEvent {
        entry_id,
        publisher,
        content_address,
        description,
    } = &event.payload;
    println!(
        "{label} : #{entry_id} {publisher} {content_address} {description} (block {})",
        event.position.block
    );
}

#[cfg(test)]
mod tests {
    use discoball::{entry::EventPosition, pins::PinStatus, store::MemStore};

    use super::*;

    const ALICE: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
    const MALLORY: &str = "0x1Ca0eb599d249e1930BD6DE0A55E39Adc1C132b5";

    fn event(entry_id: u64, publisher: &str, content_address: &str) -> WatchEvent<MirrorEvent> {
        WatchEvent {
            delivery: Delivery::Live,
            position: EventPosition {
                block: entry_id,
                log_index: 0,
            },
            payload: MirrorEvent {
                entry_id,
                publisher: publisher.parse().unwrap(),
                content_address: content_address.to_string(),
                description: "/index.html".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn only_new_pins_are_counted() {
        let store = MemStore::new();
        store.fail_pins_of("QmBroken");
        let mut printer = Printer {
            pinner: Some(Pinner {
                store: store.clone(),
                pins: PinTable::new(),
                trust: Some(TrustSet::parse(ALICE)),
                pinned: 0,
            }),
        };

        for event in [
            event(1, ALICE, "QmA"),
            event(2, ALICE, "QmA"),
            event(3, ALICE, "QmBroken"),
            event(4, MALLORY, "QmM"),
        ] {
            assert!(printer.handle(event).await.is_continue());
        }

        let pinner = printer.pinner.unwrap();
        assert_eq!(pinner.pinned, 1);
        assert_eq!(pinner.pins.len(), 2);
        assert_eq!(pinner.pins.count(PinStatus::Failed), 1);
        assert_eq!(store.pin_requests(), 2);
    }
}
