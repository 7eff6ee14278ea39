//! Round controller.
//!
//! The indexer runs in rounds. Each round connects a fresh chain client,
//! resumes right after the last valid block, picks catch-up or live mode and
//! drives the staged pipeline until the source is exhausted (catch-up), a
//! stage fails, a reorged height is reached or shutdown is requested.
//!
//! ```text
//! Pending(penalty) -> Running -> Success
//!                             -> Failed  (consecutive errors + 1)
//! ```
//!
//! The penalty before a round is `base * consecutive_errors²`, capped.

pub mod batch;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use crate::chain::ChainConnector;
use crate::classify::Classifier;
use crate::config::Config;
use crate::db::{Importer, Repository, StagingWriter};
use crate::error::{IndexerError, IndexerResult};
use crate::extract::Extractor;
use crate::health::IndexerEvents;

pub use pipeline::RoundContext;
pub use source::BlockSource;
pub use state::{SharedState, StatsSnapshot};

/// How a round ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The source was exhausted and everything staged was promoted.
    Completed,
    /// Shutdown was requested.
    Cancelled,
}

/// Delay before the next round after `consecutive_errors` failed rounds.
#[must_use]
pub fn penalty(base: Duration, max: Duration, consecutive_errors: u32) -> Duration {
    let factor = consecutive_errors.saturating_mul(consecutive_errors);
    base.saturating_mul(factor).min(max)
}

/// Drives indexing rounds until shutdown.
pub struct Indexer {
    config: Config,
    repository: Repository,
    staging: StagingWriter,
    importer: Importer,
    connector: Arc<dyn ChainConnector>,
    state: Arc<SharedState>,
    events: Arc<dyn IndexerEvents>,
}

impl Indexer {
    /// Indexer writing to `pool` and reading the chain through `connector`.
    #[must_use]
    pub fn new(
        config: Config,
        pool: SqlitePool,
        connector: Arc<dyn ChainConnector>,
        state: Arc<SharedState>,
        events: Arc<dyn IndexerEvents>,
    ) -> Self {
        let repository = Repository::new(pool.clone());
        Self {
            config,
            importer: Importer::new(repository.clone()),
            staging: StagingWriter::new(pool),
            repository,
            connector,
            state,
            events,
        }
    }

    /// The shared state this indexer reports into.
    #[must_use]
    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Run rounds until `shutdown` is set.
    ///
    /// # Errors
    ///
    /// Only non-retryable errors (configuration faults) end the loop with an
    /// error; everything else is logged and retried after the penalty.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> IndexerResult<()> {
        info!(
            start_from_block = self.config.start_from_block(),
            bulk_threshold = self.config.bulk_threshold(),
            "Indexer starting"
        );
        let stats = tokio::spawn(report_stats(
            Arc::clone(&self.state),
            self.config.stats_report_interval(),
            shutdown.clone(),
        ));

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let wait = penalty(
                self.config.error_base_penalty(),
                self.config.error_max_penalty(),
                self.state.consecutive_errors(),
            );
            if !wait.is_zero() {
                info!(penalty_ms = wait.as_millis(), "Waiting before next round");
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break Ok(());
                        }
                        continue;
                    }
                }
            }

            match self.run_round(shutdown.clone()).await {
                Ok(RoundOutcome::Completed) => {}
                Ok(RoundOutcome::Cancelled) => break Ok(()),
                Err(IndexerError::ReorgDetected { height }) => {
                    if let Err(e) =
                        pipeline::purge_reorg(&self.repository, &self.state, height).await
                    {
                        let consecutive = self.state.record_error();
                        error!(error = %e, consecutive, "Reorg purge failed");
                    }
                }
                Err(e) if !e.is_retryable() => break Err(e),
                Err(e) => {
                    let consecutive = self.state.record_error();
                    error!(error = %e, consecutive, "Round failed");
                }
            }
        };

        stats.abort();
        info!("Indexer stopped");
        result
    }

    /// Run one round.
    ///
    /// # Errors
    ///
    /// The first stage error, [`IndexerError::ReorgDetected`] when a reorged
    /// height was reached, or the error of the round set-up.
    #[instrument(skip_all, fields(round = tracing::field::Empty))]
    pub async fn run_round(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> IndexerResult<RoundOutcome> {
        let round = self.state.record_round();
        tracing::Span::current().record("round", round);

        let client = self.connector.connect().await?;
        let last_valid = self.repository.last_valid_block().await?;
        let head = client.chain_height().await?;
        let source = BlockSource::select(
            last_valid,
            head,
            self.config.bulk_threshold(),
            self.config.start_from_block(),
        );

        let (flush_every, import_timeout) = if source.is_catch_up() {
            (
                self.config.flush_every_nth_batch_bulk(),
                self.config.import_timeout_bulk(),
            )
        } else {
            (
                self.config.flush_every_nth_batch_live(),
                self.config.import_timeout_live(),
            )
        };
        info!(?last_valid, head, ?source, flush_every, "Round started");

        let ctx = Arc::new(RoundContext {
            repository: self.repository.clone(),
            staging: self.staging.clone(),
            importer: self.importer.clone(),
            client,
            classifier: Classifier::new(self.config.hub_address()),
            extractor: Extractor::new(self.config.hub_address()),
            state: Arc::clone(&self.state),
            events: Arc::clone(&self.events),
            limits: self.config.limits(),
            fetch_retries: self.config.rpc_fetch_retries(),
            flush_every,
            import_timeout,
            poll_interval: self.config.live_poll_interval(),
        });
        let mut stages = pipeline::spawn(ctx, source, shutdown.clone());

        loop {
            tokio::select! {
                joined = stages.join_next() => match joined {
                    None => {
                        info!(round, "Round complete");
                        return Ok(RoundOutcome::Completed);
                    }
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        stop(&mut stages).await;
                        return Err(e);
                    }
                    Some(Err(join_error)) => {
                        stop(&mut stages).await;
                        return Err(IndexerError::stage_failed(join_error.to_string()));
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(round, "Shutdown requested, stopping round");
                        stop(&mut stages).await;
                        return Ok(RoundOutcome::Cancelled);
                    }
                }
            }
        }
    }
}

/// Abort every stage and wait until all of them are gone.
async fn stop(stages: &mut JoinSet<IndexerResult<()>>) {
    stages.abort_all();
    while stages.join_next().await.is_some() {}
}

async fn report_stats(
    state: Arc<SharedState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = state.snapshot();
                info!(
                    uptime_secs = stats.uptime_secs,
                    rounds = stats.rounds,
                    batches = stats.batches,
                    errors = stats.errors,
                    transactions = stats.transactions,
                    reorgs = stats.reorgs,
                    last_imported = ?stats.last_imported,
                    last_batch_unix_ms = ?stats.last_batch_unix_ms,
                    "Indexer stats"
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
