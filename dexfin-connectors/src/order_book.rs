//! Order book synchronization: REST snapshot + streamed diffs.
//!
//! # State machine
//!
//! ```text
//! Uninitialized ──► SnapshotLoading ──► Synced ──► Stale
//!                        ▲    │            │         │
//!                        │    └─ failure ──┘ (gap)   │
//!                        └───────────────────────────┘
//! ```
//!
//! - While loading, diffs are buffered (bounded, oldest dropped first).
//! - A loaded snapshot discards buffered diffs it already covers and replays
//!   the rest in order, starting with the one that straddles the snapshot.
//! - While synced, a diff must start exactly one past the current sequence.
//!   Older diffs are discarded; a jump forward is a gap and forces a reload.
//! - No diff or heartbeat within `stale_after` marks the book stale.
//!
//! [`BookSync`] holds the transitions and does no I/O. [`OrderBookSynchronizer`]
//! drives it from an event queue and a [`SnapshotSource`], publishing every
//! change through a `watch` channel as an `Arc` copy of the book.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dexfin_domain::{BookLevel, OrderBookDiff, OrderBookSnapshot, TradingPair};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectorError, ConnectorResult};
use crate::rest::RestClient;
use crate::symbol_map::SymbolMap;

// =============================================================================
// Types
// =============================================================================

/// Synchronization state of one book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    /// Nothing loaded yet
    Uninitialized,
    /// Waiting for a snapshot; diffs are buffered
    SnapshotLoading,
    /// Snapshot loaded and diffs applied in sequence
    Synced,
    /// No activity within the stale interval, or snapshots keep failing
    Stale,
}

impl fmt::Display for BookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookState::Uninitialized => "uninitialized",
            BookState::SnapshotLoading => "snapshot_loading",
            BookState::Synced => "synced",
            BookState::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// Input from the stream listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookEvent {
    /// Incremental update
    Diff(OrderBookDiff),
    /// Connection is alive (ping/pong)
    Heartbeat,
}

/// What readers see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookView {
    /// Current state
    pub state: BookState,
    /// Last good book, if any (kept across gaps and failures)
    pub book: Option<Arc<OrderBookSnapshot>>,
    /// Consecutive snapshot failures
    pub consecutive_failures: u32,
}

impl BookView {
    /// The book, only when it is synced.
    pub fn fresh(&self) -> Option<&Arc<OrderBookSnapshot>> {
        match self.state {
            BookState::Synced => self.book.as_ref(),
            _ => None,
        }
    }
}

/// Synchronizer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookSyncConfig {
    /// Maximum diffs held while a snapshot loads
    pub buffer_capacity: usize,
    /// Silence after which a synced book is stale
    pub stale_after: Duration,
    /// First retry delay after a failed snapshot
    pub initial_backoff: Duration,
    /// Retry delay ceiling
    pub max_backoff: Duration,
    /// Failures before the book is reported stale
    pub failure_report_threshold: u32,
}

impl Default for BookSyncConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1_000,
            stale_after: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            failure_report_threshold: 5,
        }
    }
}

/// Result of feeding one diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Folded into the book
    Applied,
    /// Already covered, malformed or for another pair
    Discarded,
    /// Held until the next snapshot
    Buffered,
    /// Sequence jumped; a new snapshot is required
    Gap,
}

/// Missing sequences between the book and the next diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// Sequence the book needed next
    pub expected: u64,
    /// First sequence actually available
    pub received: u64,
}

// =============================================================================
// State machine
// =============================================================================

/// Pure snapshot/diff reconciliation for one instrument.
#[derive(Debug, Clone)]
pub struct BookSync {
    pair: TradingPair,
    state: BookState,
    book: Option<Arc<OrderBookSnapshot>>,
    sequence: u64,
    /// False after a snapshot without sequence until the first diff lands
    anchored: bool,
    buffer: VecDeque<OrderBookDiff>,
    buffer_capacity: usize,
    consecutive_failures: u32,
    failure_report_threshold: u32,
}

impl BookSync {
    /// New, uninitialized book.
    pub fn new(pair: TradingPair, config: &BookSyncConfig) -> Self {
        Self {
            pair,
            state: BookState::Uninitialized,
            book: None,
            sequence: 0,
            anchored: false,
            buffer: VecDeque::new(),
            buffer_capacity: config.buffer_capacity.max(1),
            consecutive_failures: 0,
            failure_report_threshold: config.failure_report_threshold.max(1),
        }
    }

    pub fn pair(&self) -> &TradingPair {
        &self.pair
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    /// Last applied sequence.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Diffs waiting for a snapshot.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Reader view. After repeated snapshot failures a loading book reports
    /// itself stale.
    pub fn view(&self) -> BookView {
        let state = match self.state {
            BookState::SnapshotLoading
                if self.consecutive_failures >= self.failure_report_threshold =>
            {
                BookState::Stale
            }
            state => state,
        };
        BookView {
            state,
            book: self.book.clone(),
            consecutive_failures: self.consecutive_failures,
        }
    }

    /// Enter `SnapshotLoading`.
    pub fn begin_loading(&mut self) {
        self.state = BookState::SnapshotLoading;
    }

    /// Flag a synced book stale.
    pub fn mark_stale(&mut self) {
        if self.state == BookState::Synced {
            self.state = BookState::Stale;
        }
    }

    /// Feed one diff.
    pub fn on_diff(&mut self, diff: OrderBookDiff) -> DiffOutcome {
        if diff.pair != self.pair || diff.sequence_end < diff.sequence_start {
            debug!(pair = %self.pair, diff_pair = %diff.pair, "Discarding malformed diff");
            return DiffOutcome::Discarded;
        }

        if self.state != BookState::Synced {
            self.buffer_diff(diff);
            return DiffOutcome::Buffered;
        }

        if !self.anchored {
            self.fold(&diff);
            self.anchored = true;
            debug!(pair = %self.pair, sequence = self.sequence, "Book anchored by first diff");
            return DiffOutcome::Applied;
        }

        let expected = self.sequence + 1;
        if diff.sequence_start < expected {
            DiffOutcome::Discarded
        } else if diff.sequence_start == expected {
            self.fold(&diff);
            DiffOutcome::Applied
        } else {
            warn!(
                pair = %self.pair,
                expected,
                received = diff.sequence_start,
                "Sequence gap, reloading snapshot"
            );
            self.state = BookState::SnapshotLoading;
            self.buffer.clear();
            self.buffer.push_back(diff);
            DiffOutcome::Gap
        }
    }

    /// Install a snapshot and replay the buffer.
    ///
    /// On a gap between the snapshot and the buffered diffs the book stays in
    /// `SnapshotLoading` and another fetch is needed.
    pub fn on_snapshot(&mut self, snapshot: OrderBookSnapshot) -> Result<(), SequenceGap> {
        self.consecutive_failures = 0;
        self.sequence = snapshot.sequence_id;
        self.book = Some(Arc::new(snapshot));

        if self.sequence == 0 {
            if !self.buffer.is_empty() {
                debug!(pair = %self.pair, dropped = self.buffer.len(), "Snapshot has no sequence, dropping buffer");
            }
            self.buffer.clear();
            self.anchored = false;
            self.state = BookState::Synced;
            return Ok(());
        }

        self.anchored = true;
        while let Some(diff) = self.buffer.pop_front() {
            if diff.sequence_end <= self.sequence {
                continue;
            }
            if diff.sequence_start > self.sequence + 1 {
                let gap = SequenceGap {
                    expected: self.sequence + 1,
                    received: diff.sequence_start,
                };
                self.buffer.push_front(diff);
                self.state = BookState::SnapshotLoading;
                return Err(gap);
            }
            self.fold(&diff);
        }

        self.state = BookState::Synced;
        Ok(())
    }

    /// Record a failed snapshot fetch. Returns the consecutive failure count.
    pub fn on_snapshot_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    fn buffer_diff(&mut self, diff: OrderBookDiff) {
        if self.buffer.len() >= self.buffer_capacity {
            self.buffer.pop_front();
            debug!(pair = %self.pair, capacity = self.buffer_capacity, "Diff buffer full, dropped oldest");
        }
        self.buffer.push_back(diff);
    }

    fn fold(&mut self, diff: &OrderBookDiff) {
        let next = match &self.book {
            Some(book) => book.with_diff(diff),
            None => OrderBookSnapshot::from_levels(
                self.pair.clone(),
                diff.timestamp_ms,
                diff.sequence_end,
                diff.bid_updates.iter().copied(),
                diff.ask_updates.iter().copied(),
            ),
        };
        self.sequence = diff.sequence_end;
        self.book = Some(Arc::new(next));
    }
}

// =============================================================================
// Snapshot source
// =============================================================================

/// Where full snapshots come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current full book for `pair`.
    async fn fetch_snapshot(&self, pair: &TradingPair) -> ConnectorResult<OrderBookSnapshot>;
}

/// Snapshots from `GET /public/markets/{symbol}/depth`.
#[derive(Debug, Clone)]
pub struct RestSnapshotSource {
    rest: Arc<RestClient>,
    symbols: Arc<SymbolMap>,
}

impl RestSnapshotSource {
    pub fn new(rest: Arc<RestClient>, symbols: Arc<SymbolMap>) -> Self {
        Self { rest, symbols }
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    async fn fetch_snapshot(&self, pair: &TradingPair) -> ConnectorResult<OrderBookSnapshot> {
        let symbol = self.symbols.resolve_or_refresh(pair).await?;
        let depth = self.rest.depth(&symbol).await.map_err(|e| {
            if e.is_unknown_market() {
                self.symbols.invalidate();
            }
            e
        })?;

        Ok(OrderBookSnapshot::from_levels(
            pair.clone(),
            depth.timestamp * 1000,
            depth.sequence.unwrap_or(0),
            depth.bids.into_iter().map(BookLevel::from),
            depth.asks.into_iter().map(BookLevel::from),
        ))
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Read side of a synchronizer.
#[derive(Debug, Clone)]
pub struct BookHandle {
    rx: watch::Receiver<BookView>,
}

impl BookHandle {
    /// Latest view, without waiting.
    pub fn current_book(&self) -> BookView {
        self.rx.borrow().clone()
    }

    /// Receiver notified on every published change.
    pub fn subscribe(&self) -> watch::Receiver<BookView> {
        self.rx.clone()
    }
}

/// Keeps one instrument's book consistent.
pub struct OrderBookSynchronizer {
    config: BookSyncConfig,
    source: Arc<dyn SnapshotSource>,
    events: mpsc::Receiver<BookEvent>,
    events_closed: bool,
    sync: BookSync,
    publisher: watch::Sender<BookView>,
    last_activity: Instant,
}

impl OrderBookSynchronizer {
    /// Create a synchronizer fed by `events`.
    pub fn new(
        pair: TradingPair,
        config: BookSyncConfig,
        source: Arc<dyn SnapshotSource>,
        events: mpsc::Receiver<BookEvent>,
    ) -> Self {
        let sync = BookSync::new(pair, &config);
        let (publisher, _) = watch::channel(sync.view());

        Self {
            config,
            source,
            events,
            events_closed: false,
            sync,
            publisher,
            last_activity: Instant::now(),
        }
    }

    pub fn pair(&self) -> &TradingPair {
        self.sync.pair()
    }

    /// Reader handle; stays valid after `run` consumes the synchronizer.
    pub fn handle(&self) -> BookHandle {
        BookHandle {
            rx: self.publisher.subscribe(),
        }
    }

    /// Latest view.
    pub fn current_book(&self) -> BookView {
        self.publisher.borrow().clone()
    }

    /// Receiver notified on every published change.
    pub fn subscribe(&self) -> watch::Receiver<BookView> {
        self.publisher.subscribe()
    }

    fn publish(&self) {
        self.publisher.send_replace(self.sync.view());
    }

    /// Run until cancelled or the event queue closes.
    ///
    /// # Errors
    /// `ConnectorError::Cancelled` when `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> ConnectorResult<()> {
        info!(pair = %self.pair(), "Order book synchronizer started");

        loop {
            match self.sync.state() {
                BookState::Uninitialized | BookState::Stale => {
                    self.sync.begin_loading();
                    self.publish();
                }
                BookState::SnapshotLoading => {
                    self.load_snapshot(&cancel).await?;
                    self.publish();
                }
                BookState::Synced => {
                    if self.events_closed {
                        info!(pair = %self.pair(), "Event queue closed, synchronizer stopping");
                        // Nothing will update this book again
                        self.sync.mark_stale();
                        self.publish();
                        return Ok(());
                    }
                    let deadline = self.last_activity + self.config.stale_after;

                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            info!(pair = %self.pair(), "Order book synchronizer cancelled");
                            return Err(ConnectorError::Cancelled);
                        }

                        event = self.events.recv() => match event {
                            Some(event) => self.handle_synced_event(event),
                            None => self.events_closed = true,
                        },

                        _ = sleep_until(deadline) => {
                            warn!(
                                pair = %self.pair(),
                                stale_after_ms = self.config.stale_after.as_millis() as u64,
                                "No book activity, marking stale"
                            );
                            self.sync.mark_stale();
                            self.publish();
                        }
                    }
                }
            }
        }
    }

    fn handle_synced_event(&mut self, event: BookEvent) {
        self.last_activity = Instant::now();
        match event {
            BookEvent::Heartbeat => {}
            BookEvent::Diff(diff) => match self.sync.on_diff(diff) {
                DiffOutcome::Applied | DiffOutcome::Gap => self.publish(),
                DiffOutcome::Discarded | DiffOutcome::Buffered => {}
            },
        }
    }

    /// Feed an event received while no snapshot is installed.
    fn buffer_event(&mut self, event: Option<BookEvent>) {
        match event {
            Some(BookEvent::Diff(diff)) => {
                self.sync.on_diff(diff);
            }
            Some(BookEvent::Heartbeat) => {}
            None => self.events_closed = true,
        }
    }

    /// Fetch snapshots until one installs cleanly, buffering diffs meanwhile.
    async fn load_snapshot(&mut self, cancel: &CancellationToken) -> ConnectorResult<()> {
        let source = self.source.clone();
        let pair = self.pair().clone();
        let mut backoff = self.config.initial_backoff;

        loop {
            let fetch = source.fetch_snapshot(&pair);
            tokio::pin!(fetch);

            let result = loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),

                    result = &mut fetch => break result,

                    event = self.events.recv(), if !self.events_closed => self.buffer_event(event),
                }
            };

            match result {
                Ok(snapshot) => {
                    let sequence = snapshot.sequence_id;
                    match self.sync.on_snapshot(snapshot) {
                        Ok(()) => {
                            self.last_activity = Instant::now();
                            info!(pair = %pair, snapshot_sequence = sequence, sequence = self.sync.sequence(), "Order book synced");
                            return Ok(());
                        }
                        Err(gap) => {
                            warn!(pair = %pair, expected = gap.expected, received = gap.received, "Snapshot older than buffered diffs, refetching");
                            self.publish();
                            self.wait_buffering(self.config.initial_backoff, cancel).await?;
                        }
                    }
                }
                Err(e) => {
                    let failures = self.sync.on_snapshot_failure();
                    if failures >= self.config.failure_report_threshold {
                        error!(pair = %pair, failures, error = %e, "Order book snapshot keeps failing");
                    } else {
                        warn!(pair = %pair, failures, error = %e, "Order book snapshot failed");
                    }
                    self.publish();
                    self.wait_buffering(backoff, cancel).await?;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    async fn wait_buffering(&mut self, delay: Duration, cancel: &CancellationToken) -> ConnectorResult<()> {
        let wake = sleep(delay);
        tokio::pin!(wake);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),

                _ = &mut wake => return Ok(()),

                event = self.events.recv(), if !self.events_closed => self.buffer_event(event),
            }
        }
    }
}

impl fmt::Debug for OrderBookSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderBookSynchronizer")
            .field("pair", self.pair())
            .field("state", &self.sync.state())
            .field("sequence", &self.sync.sequence())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
