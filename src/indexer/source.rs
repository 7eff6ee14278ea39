//! Block sources: which heights a round indexes and in what order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument};

use super::retry::with_retries;
use super::state::SharedState;
use crate::chain::ChainClient;
use crate::error::IndexerResult;

/// Where a round gets its block heights from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// Far behind the head: emit `from..=to` eagerly, then end the round.
    CatchUp {
        /// First height
        from: u64,
        /// Chain head at round start
        to: u64,
    },
    /// Close to the head: poll for new heights until the round is stopped.
    Live {
        /// First height
        from: u64,
    },
}

impl BlockSource {
    /// Pick the source for a round.
    ///
    /// Indexing resumes right after `last_persisted`, or at
    /// `start_from_block` on an empty store. More than `bulk_threshold`
    /// missing blocks select catch-up mode.
    #[must_use]
    pub fn select(
        last_persisted: Option<u64>,
        chain_head: u64,
        bulk_threshold: u64,
        start_from_block: u64,
    ) -> Self {
        let from = last_persisted.map_or(start_from_block, |last| last + 1);
        let missing = (chain_head + 1).saturating_sub(from);
        if missing > bulk_threshold {
            Self::CatchUp {
                from,
                to: chain_head,
            }
        } else {
            Self::Live { from }
        }
    }

    /// First height emitted.
    #[must_use]
    pub const fn from(&self) -> u64 {
        match self {
            Self::CatchUp { from, .. } | Self::Live { from } => *from,
        }
    }

    /// `true` in catch-up mode.
    #[must_use]
    pub const fn is_catch_up(&self) -> bool {
        matches!(self, Self::CatchUp { .. })
    }

    /// Feed heights into `tx` until the source is exhausted, the receiver is
    /// gone or `shutdown` is set.
    ///
    /// In live mode every poll first re-emits the pending reorg heights,
    /// lowest first, so the round reaches the purge before any newer block.
    ///
    /// # Errors
    ///
    /// Returns the RPC error if the chain head cannot be read after
    /// `fetch_retries` attempts.
    #[instrument(skip_all, fields(source = ?self))]
    pub async fn produce(
        self,
        client: Arc<dyn ChainClient>,
        state: Arc<SharedState>,
        poll_interval: Duration,
        fetch_retries: u32,
        tx: mpsc::Sender<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) -> IndexerResult<()> {
        match self {
            Self::CatchUp { from, to } => {
                info!(from, to, blocks = to - from + 1, "Catching up");
                for height in from..=to {
                    let stopping = *shutdown.borrow();
                    if stopping || tx.send(height).await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
            Self::Live { from } => {
                info!(from, "Following chain head");
                let mut next = from;
                loop {
                    for height in state.pending_reorgs() {
                        debug!(height, "Re-emitting reorged height");
                        if tx.send(height).await.is_err() {
                            return Ok(());
                        }
                    }

                    let head = with_retries("chain head", fetch_retries, || {
                        client.chain_height()
                    })
                    .await?;
                    while next <= head {
                        if tx.send(next).await.is_err() {
                            return Ok(());
                        }
                        next += 1;
                    }

                    tokio::select! {
                        () = tokio::time::sleep(poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}
