//! Reorg checker implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::chain::{ChainClient, ChainConnector};
use crate::db::Repository;
use crate::error::IndexerResult;
use crate::indexer::state::SharedState;

/// Compares the most recent stored block hashes with the chain.
///
/// The checker never purges anything itself. It reports the lowest height
/// whose stored hash no longer matches the canonical chain; the round that
/// reaches that height stops and the round controller purges from there.
///
/// ## Example
///
/// ```rust,ignore
/// let checker = ReorgChecker::new(repository, 18);
/// if let Some(height) = checker.check(client.as_ref()).await? {
///     state.push_reorg(height);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ReorgChecker {
    repository: Repository,
    depth: u64,
}

impl ReorgChecker {
    /// Checker over the newest `depth` permanent blocks.
    #[must_use]
    pub const fn new(repository: Repository, depth: u64) -> Self {
        Self { repository, depth }
    }

    /// Number of stored blocks compared per check.
    #[must_use]
    pub const fn depth(&self) -> u64 {
        self.depth
    }

    /// Lowest stored height whose hash differs from the chain, if any.
    ///
    /// A height the node no longer knows counts as a mismatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored hashes cannot be read or an RPC call
    /// fails.
    #[instrument(skip(self, client), fields(depth = self.depth))]
    pub async fn check(&self, client: &dyn ChainClient) -> IndexerResult<Option<u64>> {
        let stored = self.repository.recent_block_hashes(self.depth).await?;
        if stored.is_empty() {
            debug!("No stored blocks to compare");
            return Ok(None);
        }

        let mut lowest = None;
        for (height, hash) in stored {
            let on_chain = client.block_hash(height).await?;
            if on_chain != Some(hash) {
                warn!(
                    height,
                    stored = %hash,
                    on_chain = ?on_chain,
                    "Stored block hash no longer on chain"
                );
                lowest = Some(lowest.map_or(height, |l: u64| l.min(height)));
            }
        }

        Ok(lowest)
    }

    /// Check every `interval` until `shutdown` flips to `true`, pushing the
    /// lowest mismatching height into the shared reorg set.
    ///
    /// Each check connects a fresh client so a broken connection never
    /// outlives one tick. Failures are logged and retried on the next tick.
    pub async fn run(
        self,
        connector: Arc<dyn ChainConnector>,
        state: Arc<SharedState>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            depth = self.depth,
            "Reorg checker started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is not slowed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let client = match connector.connect().await {
                Ok(client) => client,
                Err(e) => {
                    warn!(error = %e, "Reorg check skipped, no chain connection");
                    continue;
                }
            };
            match self.check(client.as_ref()).await {
                Ok(Some(height)) => {
                    warn!(height, "Reorg detected, scheduling purge");
                    state.push_reorg(height);
                }
                Ok(None) => debug!("No reorg"),
                Err(e) => warn!(error = %e, "Reorg check failed"),
            }
        }

        info!("Reorg checker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainBlock, TxReceipt};
    use crate::db::create_pool;
    use crate::error::IndexerError;
    use alloy::primitives::{Address, B256};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedHashes(HashMap<u64, B256>);

    #[async_trait]
    impl ChainClient for FixedHashes {
        async fn chain_height(&self) -> IndexerResult<u64> {
            Ok(self.0.keys().copied().max().unwrap_or(0))
        }

        async fn block_with_transactions(&self, _height: u64) -> IndexerResult<Option<ChainBlock>> {
            Err(IndexerError::rpc("not used", None))
        }

        async fn block_hash(&self, height: u64) -> IndexerResult<Option<B256>> {
            Ok(self.0.get(&height).copied())
        }

        async fn transaction_receipt(&self, _hash: B256) -> IndexerResult<Option<TxReceipt>> {
            Ok(None)
        }

        async fn safe_owners(&self, _safe: Address) -> IndexerResult<Vec<Address>> {
            Ok(Vec::new())
        }
    }

    async fn stored_chain(heights: std::ops::RangeInclusive<u64>) -> Repository {
        let pool = create_pool("sqlite::memory:").await.expect("pool");
        let repository = Repository::new(pool);
        for number in heights {
            let block = ChainBlock {
                number,
                hash: B256::with_last_byte(u8::try_from(number % 256).expect("byte")),
                timestamp: 1_700_000_000 + number,
                transactions: Vec::new(),
            };
            repository.insert_empty_block(&block).await.expect("insert");
        }
        repository
    }

    fn canonical(heights: std::ops::RangeInclusive<u64>) -> HashMap<u64, B256> {
        heights
            .map(|h| (h, B256::with_last_byte(u8::try_from(h % 256).expect("byte"))))
            .collect()
    }

    #[tokio::test]
    async fn test_matching_chain_has_no_reorg() {
        let checker = ReorgChecker::new(stored_chain(100..=120).await, 18);
        let client = FixedHashes(canonical(100..=120));
        assert_eq!(checker.check(&client).await.expect("check"), None);
    }

    #[tokio::test]
    async fn test_lowest_mismatch_is_reported() {
        let checker = ReorgChecker::new(stored_chain(100..=120).await, 18);
        let mut hashes = canonical(100..=120);
        for h in [110, 111, 115] {
            hashes.insert(h, B256::repeat_byte(0xee));
        }
        assert_eq!(
            checker.check(&FixedHashes(hashes)).await.expect("check"),
            Some(110)
        );
    }

    #[tokio::test]
    async fn test_mismatch_below_depth_is_not_seen() {
        let checker = ReorgChecker::new(stored_chain(100..=120).await, 5);
        let mut hashes = canonical(100..=120);
        hashes.insert(105, B256::repeat_byte(0xee));
        assert_eq!(checker.check(&FixedHashes(hashes)).await.expect("check"), None);
    }

    #[tokio::test]
    async fn test_unknown_height_counts_as_mismatch() {
        let checker = ReorgChecker::new(stored_chain(100..=110).await, 18);
        let client = FixedHashes(canonical(100..=108));
        assert_eq!(checker.check(&client).await.expect("check"), Some(109));
    }

    #[tokio::test]
    async fn test_empty_store_has_nothing_to_check() {
        let pool = create_pool("sqlite::memory:").await.expect("pool");
        let checker = ReorgChecker::new(Repository::new(pool), 18);
        assert_eq!(
            checker.check(&FixedHashes(HashMap::new())).await.expect("check"),
            None
        );
    }
}
