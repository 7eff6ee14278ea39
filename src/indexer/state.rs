//! Process-wide indexer state shared by the round controller, the pipeline
//! stages, the reorg checker and the health monitor.
//!
//! Every counter is an independent statistic that orders nothing else, so
//! all atomics use [`Ordering::Relaxed`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use serde::Serialize;

const NONE: u64 = u64::MAX;

/// Counters and shared sets, created once at start and passed around by `Arc`.
#[derive(Debug)]
pub struct SharedState {
    started_at: Instant,
    rounds: AtomicU64,
    batches: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU32,
    transactions: AtomicU64,
    reorgs: AtomicU64,
    last_batch_unix_ms: AtomicU64,
    last_imported: AtomicU64,
    importing: AtomicU64,
    request_counts: DashMap<u64, u32>,
    reorg_heights: DashSet<u64>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Seconds since start
    pub uptime_secs: u64,
    /// Rounds started
    pub rounds: u64,
    /// Batches staged
    pub batches: u64,
    /// Failed rounds
    pub errors: u64,
    /// Failed rounds since the last successful batch
    pub consecutive_errors: u32,
    /// Transactions staged
    pub transactions: u64,
    /// Reorgs handled
    pub reorgs: u64,
    /// Unix milliseconds of the last completed batch
    pub last_batch_unix_ms: Option<u64>,
    /// Highest promoted block
    pub last_imported: Option<u64>,
    /// Height of the import in progress
    pub importing: Option<u64>,
}

const fn optional(value: u64) -> Option<u64> {
    if value == NONE {
        None
    } else {
        Some(value)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    /// Fresh state at process start.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            rounds: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            transactions: AtomicU64::new(0),
            reorgs: AtomicU64::new(0),
            last_batch_unix_ms: AtomicU64::new(NONE),
            last_imported: AtomicU64::new(NONE),
            importing: AtomicU64::new(NONE),
            request_counts: DashMap::new(),
            reorg_heights: DashSet::new(),
        }
    }

    /// A round has started.
    pub fn record_round(&self) -> u64 {
        self.rounds.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A round failed; returns the consecutive error count.
    pub fn record_error(&self) -> u32 {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Failed rounds since the last successful batch.
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// A batch of `transactions` was staged. Resets the consecutive error count.
    pub fn record_batch(&self, transactions: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.transactions.fetch_add(transactions, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    /// `height` was requested once more; returns how often in total.
    pub fn record_request(&self, height: u64) -> u32 {
        let mut count = self.request_counts.entry(height).or_insert(0);
        *count += 1;
        *count
    }

    /// An import of everything up to `height` is starting.
    pub fn record_import_start(&self, height: u64) {
        self.importing.store(height, Ordering::Relaxed);
    }

    /// Everything up to `height` is permanent.
    pub fn record_completed(&self, height: u64) {
        self.request_counts.retain(|requested, _| *requested > height);
        self.last_imported.store(height, Ordering::Relaxed);
        self.importing.store(NONE, Ordering::Relaxed);
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        self.last_batch_unix_ms.store(now, Ordering::Relaxed);
    }

    /// The most often requested height that has not completed yet.
    #[must_use]
    pub fn most_repeated_request(&self) -> Option<(u64, u32)> {
        self.request_counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .max_by_key(|(height, count)| (*count, std::cmp::Reverse(*height)))
    }

    /// Mark `height` as the lowest block known to be reorged.
    pub fn push_reorg(&self, height: u64) {
        if self.reorg_heights.insert(height) {
            self.reorgs.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pending reorg heights, ascending. The set is left untouched.
    #[must_use]
    pub fn pending_reorgs(&self) -> Vec<u64> {
        let mut heights: Vec<u64> = self.reorg_heights.iter().map(|h| *h).collect();
        heights.sort_unstable();
        heights
    }

    /// Whether `height` is a pending reorg height.
    #[must_use]
    pub fn is_reorg(&self, height: u64) -> bool {
        self.reorg_heights.contains(&height)
    }

    /// Forget all pending reorg heights after a purge.
    pub fn clear_reorgs(&self) {
        self.reorg_heights.clear();
    }

    /// Milliseconds since the last completed batch, `None` if there was none.
    #[must_use]
    pub fn millis_since_last_batch(&self) -> Option<u64> {
        let last = optional(self.last_batch_unix_ms.load(Ordering::Relaxed))?;
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        Some(now.saturating_sub(last))
    }

    /// Copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            rounds: self.rounds.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            reorgs: self.reorgs.load(Ordering::Relaxed),
            last_batch_unix_ms: optional(self.last_batch_unix_ms.load(Ordering::Relaxed)),
            last_imported: optional(self.last_imported.load(Ordering::Relaxed)),
            importing: optional(self.importing.load(Ordering::Relaxed)),
        }
    }
}
