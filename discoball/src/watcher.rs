//! Catch-up/live watcher over the registry event log.
//!
//! A [`Watcher`] turns an [`EventSource`] into one ordered, deduplicated stream of events:
//!
//! 1. *Initializing*: waits, bounded by [`WatcherConfig::sync_timeout`], until the node
//!    reports it is synced.
//! 2. *CatchUp*: replays every event from the start block (or the persisted
//!    [`WatchCursor`]) up to the head observed when the phase started.
//! 3. *Live*: polls the head every [`WatcherConfig::poll_interval`] and delivers whatever
//!    was appended since.
//!
//! A transient failure of the source moves the watcher to *Reconnecting*. It polls the
//! source with exponential backoff and on success re-enters catch-up from the last delivered
//! position, so no event window is lost. Exhausting [`RetryConfig::max_retries`] is fatal.
//!
//! Events are delivered in ascending [`EventPosition`] order, and each entry id at most once
//! per watcher lifetime. The cursor only advances past an event once it has been handed to
//! the consumer, or once it has been rejected as malformed.

use std::{
    collections::HashSet,
    fmt,
    future::Future,
    io,
    ops::ControlFlow,
    path::{Path, PathBuf},
    time::Duration,
};

use backoff::{
    backoff::Backoff,
    exponential::{ExponentialBackoff, ExponentialBackoffBuilder},
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    abi::event_topic,
    entry::EventPosition,
    ledger::{EventSource, LedgerError, RawEvent, SyncStatus},
};

/// Describes one kind of event: how to find it and how to validate it.
pub trait EventShape: Send + Sync {
    /// The validated event.
    type Payload: fmt::Debug + Clone + Send + 'static;

    /// Solidity signature, used to derive the topic.
    fn signature(&self) -> &'static str;

    /// Validate a raw event.
    fn decode(&self, event: &RawEvent) -> Result<Self::Payload, MalformedEvent>;

    /// Id used for deduplication, if the event carries one.
    fn entry_id(&self, payload: &Self::Payload) -> Option<u64>;
}

/// An event that failed validation. Logged and skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed event at {position}: {reason}")]
pub struct MalformedEvent {
    /// Where the event sits.
    pub position: EventPosition,
    /// What was wrong with it.
    pub reason: String,
}

impl MalformedEvent {
    /// Create a new error.
    pub fn new(position: EventPosition, reason: impl fmt::Display) -> Self {
        Self {
            position,
            reason: reason.to_string(),
        }
    }
}

/// Retry policy for reconnecting to the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// First delay.
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    /// Upper bound of a single delay.
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

/// Watcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherConfig {
    /// How often to poll for new events once caught up.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How often to poll a syncing node.
    #[serde(with = "humantime_serde")]
    pub sync_poll_interval: Duration,
    /// How long to wait for a syncing node before giving up.
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
    /// Largest block range requested at once.
    pub max_block_range: u64,
    /// Reconnect policy.
    pub retry: RetryConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            sync_poll_interval: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(60 * 60),
            max_block_range: 2000,
            retry: RetryConfig::default(),
        }
    }
}

/// Position of a watcher in the event log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCursor {
    /// Last event delivered or skipped.
    pub last_seen: Option<EventPosition>,
    /// Every block up to and including this one has been fully processed.
    pub scanned_through: Option<u64>,
}

/// Errors reading or writing a persisted cursor.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    /// The file could not be read or written.
    #[error("cursor file {}: {source}", .path.display())]
    Io {
        /// The cursor file.
        path: PathBuf,
        /// The io error.
        #[source]
        source: io::Error,
    },
    /// The file does not contain a cursor.
    #[error("corrupt cursor file {}: {source}", .path.display())]
    Corrupt {
        /// The cursor file.
        path: PathBuf,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl WatchCursor {
    /// Load a cursor, `None` if the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>, CursorError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CursorError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| CursorError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Atomically replace the cursor file.
    pub async fn save(&self, path: &Path) -> Result<(), CursorError> {
        let io_err = |source| CursorError::Io {
            path: path.to_path_buf(),
            source,
        };
        let data = serde_json::to_vec(self).map_err(|source| CursorError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)
    }
}

/// What the watcher is doing, observable through [`Watcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WatchStatus {
    /// Waiting for the node, `syncing` while it reports it is still importing blocks.
    Initializing {
        /// Whether the node is still syncing.
        syncing: bool,
    },
    /// Replaying history.
    CatchUp,
    /// Tailing new events.
    Live,
    /// Waiting to retry after a source failure.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
    /// The watcher has exited.
    Stopped,
}

/// How an event was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Delivery {
    /// Replayed during catch-up.
    CatchUp,
    /// Picked up while tailing.
    Live,
}

/// An event handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent<P> {
    /// Which phase found the event.
    pub delivery: Delivery,
    /// Position in the log.
    pub position: EventPosition,
    /// The validated payload.
    pub payload: P,
}

/// Consumes the events of a [`Watcher`].
///
/// The cursor moves past an event only once [`EventHandler::handle`] has returned for it, so a
/// handler that does its work inline never loses an event across restarts.
pub trait EventHandler<P>: Send {
    /// Handle one event. [`ControlFlow::Break`] stops the watcher.
    fn handle(&mut self, event: WatchEvent<P>) -> impl Future<Output = ControlFlow<()>> + Send;
}

/// Hands events to a channel. An event counts as handled once it is queued, and the watcher
/// stops when the receiver is dropped.
impl<P: Send> EventHandler<P> for mpsc::Sender<WatchEvent<P>> {
    async fn handle(&mut self, event: WatchEvent<P>) -> ControlFlow<()> {
        match self.send(event).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

impl<P, H: EventHandler<P>> EventHandler<P> for &mut H {
    fn handle(&mut self, event: WatchEvent<P>) -> impl Future<Output = ControlFlow<()>> + Send {
        (**self).handle(event)
    }
}

/// Errors that stop the watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The source failed in a way retrying cannot fix.
    #[error("event source failed: {0}")]
    Source(#[from] LedgerError),
    /// The node did not finish syncing in time.
    #[error("node still syncing after {0:?}")]
    SyncTimeout(Duration),
    /// The source stayed unreachable.
    #[error("event source unavailable after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        #[source]
        source: LedgerError,
    },
    /// The head moved below blocks that were already processed.
    #[error("chain reorganized: head {head} is behind processed block {scanned}")]
    Reorganized {
        /// The reported head.
        head: u64,
        /// The last processed block.
        scanned: u64,
    },
    /// The cursor could not be persisted.
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// The catch-up/live watcher. See the [module docs](self).
#[derive(Debug)]
pub struct Watcher<E, S> {
    source: E,
    shape: S,
    topic: [u8; 32],
    config: WatcherConfig,
    start_block: u64,
    cursor: WatchCursor,
    cursor_path: Option<PathBuf>,
    seen_ids: HashSet<u64>,
    failures: u32,
    backoff: ExponentialBackoff<backoff::SystemClock>,
    status: watch::Sender<WatchStatus>,
}

impl<E: EventSource, S: EventShape> Watcher<E, S> {
    /// Watch `shape` events of `source`, starting at block 0.
    pub fn new(source: E, shape: S, config: WatcherConfig) -> Self {
        let topic = event_topic(shape.signature());
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.retry.initial_interval)
            .with_max_interval(config.retry.max_interval)
            .with_max_elapsed_time(None)
            .build();
        let (status, _) = watch::channel(WatchStatus::Initializing { syncing: false });
        Self {
            source,
            shape,
            topic,
            config,
            start_block: 0,
            cursor: WatchCursor::default(),
            cursor_path: None,
            seen_ids: HashSet::new(),
            failures: 0,
            backoff,
            status,
        }
    }

    /// First block replayed when no cursor says otherwise.
    pub fn start_at(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    /// Resume from `cursor`.
    pub fn with_cursor(mut self, cursor: WatchCursor) -> Self {
        self.cursor = cursor;
        self
    }

    /// Save the cursor to `path` after every processed block range and on shutdown.
    pub fn persist_cursor(mut self, path: impl Into<PathBuf>) -> Self {
        self.cursor_path = Some(path.into());
        self
    }

    /// Observe the watcher's status.
    pub fn subscribe(&self) -> watch::Receiver<WatchStatus> {
        self.status.subscribe()
    }

    /// Run until cancelled, until `handler` breaks or until a fatal error.
    ///
    /// Returns the final cursor.
    pub async fn run(
        mut self,
        mut handler: impl EventHandler<S::Payload>,
        cancel: CancellationToken,
    ) -> Result<WatchCursor, WatchError> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("watcher cancelled");
                Ok(())
            }
            res = self.drive(&mut handler) => res,
        };
        self.status.send_replace(WatchStatus::Stopped);
        if let Err(err) = &outcome {
            error!("watcher stopped: {err}");
        }
        self.persist().await?;
        outcome.map(|()| self.cursor)
    }

    async fn drive(
        &mut self,
        handler: &mut impl EventHandler<S::Payload>,
    ) -> Result<(), WatchError> {
        loop {
            match self.session(handler).await {
                Ok(()) => {
                    debug!("consumer gone, stopping");
                    return Ok(());
                }
                Err(WatchError::Source(err)) if err.is_transient() => self.reconnect(err).await?,
                Err(err) => return Err(err),
            }
        }
    }

    /// One connection: sync wait, catch-up, then live until something fails.
    async fn session(
        &mut self,
        handler: &mut impl EventHandler<S::Payload>,
    ) -> Result<(), WatchError> {
        self.wait_for_sync().await?;

        self.status.send_replace(WatchStatus::CatchUp);
        let head = self.source.head().await?;
        info!(from = self.next_block(), head, "catching up");
        if self.scan_to(head, Delivery::CatchUp, handler).await?.is_break() {
            return Ok(());
        }
        info!(head, "caught up, watching for new events");

        self.status.send_replace(WatchStatus::Live);
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let head = self.source.head().await?;
            if self.scan_to(head, Delivery::Live, handler).await?.is_break() {
                return Ok(());
            }
        }
    }

    async fn wait_for_sync(&mut self) -> Result<(), WatchError> {
        let started = Instant::now();
        loop {
            match self.source.sync_status().await? {
                SyncStatus::Synced => return Ok(()),
                SyncStatus::Syncing {
                    current_block,
                    highest_block,
                } => {
                    self.status
                        .send_replace(WatchStatus::Initializing { syncing: true });
                    if started.elapsed() >= self.config.sync_timeout {
                        return Err(WatchError::SyncTimeout(self.config.sync_timeout));
                    }
                    info!(current_block, highest_block, "node is syncing, waiting");
                    tokio::time::sleep(self.config.sync_poll_interval).await;
                }
            }
        }
    }

    async fn reconnect(&mut self, mut last: LedgerError) -> Result<(), WatchError> {
        loop {
            self.failures += 1;
            if self.failures > self.config.retry.max_retries {
                return Err(WatchError::RetriesExhausted {
                    attempts: self.failures - 1,
                    source: last,
                });
            }
            self.status.send_replace(WatchStatus::Reconnecting {
                attempt: self.failures,
            });
            let delay = self
                .backoff
                .next_backoff()
                .unwrap_or(self.config.retry.max_interval);
            warn!(attempt = self.failures, ?delay, "event source failed: {last}");
            tokio::time::sleep(delay).await;
            match self.source.head().await {
                Ok(head) => {
                    info!(head, last_seen = ?self.cursor.last_seen, "reconnected, resuming");
                    return Ok(());
                }
                Err(err) if err.is_transient() => last = err,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn next_block(&self) -> u64 {
        self.cursor
            .scanned_through
            .map_or(self.start_block, |block| block + 1)
    }

    /// Deliver everything up to `head`. Breaks if the consumer is gone.
    async fn scan_to(
        &mut self,
        head: u64,
        delivery: Delivery,
        handler: &mut impl EventHandler<S::Payload>,
    ) -> Result<ControlFlow<()>, WatchError> {
        if let Some(scanned) = self.cursor.scanned_through {
            if head < scanned {
                return Err(WatchError::Reorganized { head, scanned });
            }
        }
        let range = self.config.max_block_range.max(1);
        let mut from = self.next_block();
        while from <= head {
            let to = head.min(from.saturating_add(range - 1));
            let events = self.source.events(self.topic, from, to).await?;
            debug!(from, to, count = events.len(), "fetched events");
            for event in events {
                if self.deliver(event, delivery, handler).await.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
            self.cursor.scanned_through = Some(to);
            self.failures = 0;
            self.backoff.reset();
            self.persist().await?;
            from = to + 1;
        }
        self.failures = 0;
        self.backoff.reset();
        Ok(ControlFlow::Continue(()))
    }

    async fn deliver(
        &mut self,
        event: RawEvent,
        delivery: Delivery,
        handler: &mut impl EventHandler<S::Payload>,
    ) -> ControlFlow<()> {
        let position = event.position;
        if self.cursor.last_seen.is_some_and(|seen| position <= seen) {
            return ControlFlow::Continue(());
        }
        let payload = match self.shape.decode(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("skipping {err}");
                self.cursor.last_seen = Some(position);
                return ControlFlow::Continue(());
            }
        };
        let entry_id = self.shape.entry_id(&payload);
        if let Some(id) = entry_id {
            if self.seen_ids.contains(&id) {
                debug!(%position, id, "skipping duplicate entry");
                self.cursor.last_seen = Some(position);
                return ControlFlow::Continue(());
            }
        }
        let event = WatchEvent {
            delivery,
            position,
            payload,
        };
        if handler.handle(event).await.is_break() {
            return ControlFlow::Break(());
        }
        if let Some(id) = entry_id {
            self.seen_ids.insert(id);
        }
        self.cursor.last_seen = Some(position);
        ControlFlow::Continue(())
    }

    async fn persist(&self) -> Result<(), CursorError> {
        match &self.cursor_path {
            Some(path) => self.cursor.save(path).await,
            None => Ok(()),
        }
    }
}
