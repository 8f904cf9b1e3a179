//! Publish on one side, watch and replicate on the other.

use std::time::Duration;

use discoball::{
    crawl::StaticCrawler,
    dns::StaticTxt,
    entry::DiscoMsg,
    ledger::MemLedger,
    publish::PublishPipeline,
    replicate::{ReplicationConfig, Replicator},
    store::MemStore,
    trust::TrustSet,
    watcher::{Delivery, Watcher, WatcherConfig},
    Address,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn published_entries_reach_friends() -> anyhow::Result<()> {
    let owner: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse()?;
    let ledger = MemLedger::new();
    ledger.set_writer(owner);

    let publisher_store = MemStore::new();
    let pipeline = PublishPipeline::new(
        StaticTxt::new().with_records(
            "example.com",
            [format!("discoball-site-verification={owner}")],
        ),
        StaticCrawler::new()
            .with_page("example.com", "/", "<title>home</title>")
            .with_page("example.com", "/about", "<title>about</title>"),
        publisher_store.clone(),
        ledger.clone(),
    );
    let home = pipeline.publish(&owner, "example.com", "/").await?;

    let watcher = Watcher::new(ledger.clone(), DiscoMsg, WatcherConfig::default());
    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(watcher.run(tx, cancel.clone()));

    let event = rx.recv().await.unwrap();
    assert_eq!(event.delivery, Delivery::CatchUp);
    assert_eq!(event.payload.content_address, home.content_address);

    let about = pipeline.publish(&owner, "example.com", "/about").await?;
    let event = rx.recv().await.unwrap();
    assert_eq!(event.delivery, Delivery::Live);
    assert_eq!(event.payload.content_address, about.content_address);
    assert_eq!(event.payload.publisher, owner);

    cancel.cancel();
    task.await??;

    let friend_store = MemStore::new();
    let mut replicator = Replicator::new(
        ledger,
        friend_store.clone(),
        ReplicationConfig {
            batch_size: 1,
            pin_delay: Duration::ZERO,
        },
    );
    let trust: TrustSet = [owner].into_iter().collect();
    let report = replicator.run(&trust, &CancellationToken::new()).await?;
    assert_eq!(report.new_pins(), 2);
    assert!(friend_store.pinned().contains(&home.content_address));
    assert!(friend_store.pinned().contains(&about.content_address));
    Ok(())
}
