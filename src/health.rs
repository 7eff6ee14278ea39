//! Health evaluation and new-transaction notifications.
//!
//! The pipeline reports progress through [`IndexerEvents`]; [`HealthMonitor`]
//! turns those reports into a [`HealthReport`] and fans new transaction
//! hashes out to subscribers of a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::indexer::state::{SharedState, StatsSnapshot};

/// Capacity of the new-transaction broadcast channel. Slow subscribers lag
/// and skip ahead instead of blocking the pipeline.
pub const NOTIFICATION_CAPACITY: usize = 4096;

/// Progress notifications emitted by the pipeline.
pub trait IndexerEvents: Send + Sync {
    /// `height` is about to be fetched.
    fn report_start_import(&self, height: u64);

    /// Everything up to `height` has been promoted.
    fn report_complete_batch(&self, height: u64);

    /// Transactions that just became permanent.
    fn notify_new_transactions(&self, hashes: &[B256]);
}

/// Outcome of a health evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `true` when no check failed
    pub healthy: bool,
    /// Human-readable descriptions of the failed checks
    pub reasons: Vec<String>,
    /// Counters at evaluation time
    pub stats: StatsSnapshot,
}

/// Health collaborator over the shared indexer state.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    state: Arc<SharedState>,
    sender: broadcast::Sender<B256>,
    max_request_repeats: u32,
    stale_after: Duration,
}

impl HealthMonitor {
    /// Monitor that flags a height requested `max_request_repeats` times
    /// and batches older than `stale_after`.
    #[must_use]
    pub fn new(state: Arc<SharedState>, max_request_repeats: u32, stale_after: Duration) -> Self {
        let (sender, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            state,
            sender,
            max_request_repeats,
            stale_after,
        }
    }

    /// Receiver of every transaction hash promoted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<B256> {
        self.sender.subscribe()
    }

    /// Evaluate all health checks.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let mut reasons = Vec::new();

        if let Some((height, count)) = self.state.most_repeated_request() {
            if count >= self.max_request_repeats {
                reasons.push(format!(
                    "block {height} requested {count} times without completing"
                ));
            }
        }

        match self.state.millis_since_last_batch() {
            None => reasons.push("no batch completed since start".to_string()),
            Some(elapsed_ms) => {
                let stale_ms = u64::try_from(self.stale_after.as_millis()).unwrap_or(u64::MAX);
                if elapsed_ms >= stale_ms {
                    reasons.push(format!(
                        "last batch completed {}s ago",
                        elapsed_ms / 1_000
                    ));
                }
            }
        }

        HealthReport {
            healthy: reasons.is_empty(),
            reasons,
            stats: self.state.snapshot(),
        }
    }
}

impl IndexerEvents for HealthMonitor {
    fn report_start_import(&self, height: u64) {
        let count = self.state.record_request(height);
        if count > 1 {
            debug!(height, count, "Block requested again");
        }
    }

    fn report_complete_batch(&self, height: u64) {
        self.state.record_completed(height);
    }

    fn notify_new_transactions(&self, hashes: &[B256]) {
        for hash in hashes {
            // No subscribers is fine.
            if self.sender.send(*hash).is_err() {
                trace!("No stream subscribers");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(stale_after: Duration) -> HealthMonitor {
        HealthMonitor::new(Arc::new(SharedState::new()), 5, stale_after)
    }

    #[test]
    fn test_unhealthy_before_first_batch() {
        let report = monitor(Duration::from_secs(120)).report();
        assert!(!report.healthy);
        assert_eq!(report.reasons, vec!["no batch completed since start"]);
    }

    #[test]
    fn test_healthy_after_batch() {
        let monitor = monitor(Duration::from_secs(120));
        monitor.report_start_import(10);
        monitor.report_complete_batch(10);
        let report = monitor.report();
        assert!(report.healthy, "{:?}", report.reasons);
        assert_eq!(report.stats.last_imported, Some(10));
    }

    #[test]
    fn test_looping_height_is_unhealthy() {
        let monitor = monitor(Duration::from_secs(120));
        monitor.report_complete_batch(9);
        for _ in 0..5 {
            monitor.report_start_import(10);
        }
        let report = monitor.report();
        assert!(!report.healthy);
        assert!(report.reasons[0].contains("block 10 requested 5 times"));

        monitor.report_complete_batch(10);
        assert!(monitor.report().healthy);
    }

    #[test]
    fn test_stale_batch_is_unhealthy() {
        let monitor = monitor(Duration::ZERO);
        monitor.report_complete_batch(1);
        assert!(!monitor.report().healthy);
    }

    #[tokio::test]
    async fn test_new_transactions_are_broadcast() {
        let monitor = monitor(Duration::from_secs(120));
        let mut rx = monitor.subscribe();
        let hashes = [B256::repeat_byte(1), B256::repeat_byte(2)];
        monitor.notify_new_transactions(&hashes);

        assert_eq!(rx.recv().await.expect("first"), hashes[0]);
        assert_eq!(rx.recv().await.expect("second"), hashes[1]);
    }
}
