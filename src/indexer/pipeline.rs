//! The staged pipeline of one indexing round.
//!
//! ```text
//! source -> mark -> fetch blocks -> fan out -> fetch receipts -> classify
//!        -> extract -> batch -> write to staging (+ promote every n batches)
//! ```
//!
//! Every stage is its own task, connected to the next by a bounded channel,
//! so a slow stage blocks its producers instead of dropping data. A stage
//! ends when its input closes; the first stage error ends the round.
//! Parallel stages complete out of order, which the import procedure
//! tolerates by only promoting blocks whose transactions are all staged.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::batch::run_batcher;
use super::retry::with_retries;
use super::source::BlockSource;
use super::state::SharedState;
use crate::chain::{ChainBlock, ChainClient, ChainTransaction, TxReceipt};
use crate::classify::{ClassificationSet, Classifier};
use crate::config::PipelineLimits;
use crate::db::models::{BlockHeader, IndexedTransaction};
use crate::db::{Importer, Repository, StagingWriter};
use crate::error::{IndexerError, IndexerResult};
use crate::extract::Extractor;
use crate::health::IndexerEvents;

/// Transactions extracted concurrently.
pub const EXTRACT_PARALLELISM: usize = 2;

/// Everything the stages of one round share.
pub struct RoundContext {
    /// Bookkeeping and purge
    pub repository: Repository,
    /// Staging writes
    pub staging: StagingWriter,
    /// Promotion and cleanup
    pub importer: Importer,
    /// Chain access for this round only
    pub client: Arc<dyn ChainClient>,
    /// Transaction classifier
    pub classifier: Classifier,
    /// Detail extractor
    pub extractor: Extractor,
    /// Process-wide counters and reorg set
    pub state: Arc<SharedState>,
    /// Progress notifications
    pub events: Arc<dyn IndexerEvents>,
    /// Parallelism and buffer sizes
    pub limits: PipelineLimits,
    /// Attempts per RPC fetch
    pub fetch_retries: u32,
    /// Promote after this many staged batches
    pub flush_every: u64,
    /// Deadline of one promotion attempt
    pub import_timeout: Duration,
    /// Chain head polling interval in live mode
    pub poll_interval: Duration,
}

struct PendingTransaction {
    block: BlockHeader,
    transaction: ChainTransaction,
}

struct FetchedTransaction {
    block: BlockHeader,
    transaction: ChainTransaction,
    receipt: Option<TxReceipt>,
}

struct ClassifiedTransaction {
    fetched: FetchedTransaction,
    classification: ClassificationSet,
}

fn receiver_stream<T: Send>(rx: mpsc::Receiver<T>) -> impl Stream<Item = T> + Send {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

fn bounded<T>(capacity: usize) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(capacity.max(1))
}

/// Start every stage of a round fed by `source`.
///
/// The returned set completes when the source is exhausted and every stage
/// has drained, or yields the first stage error. The caller aborts the rest.
pub fn spawn(
    ctx: Arc<RoundContext>,
    source: BlockSource,
    shutdown: watch::Receiver<bool>,
) -> JoinSet<IndexerResult<()>> {
    let limits = ctx.limits;
    let (heights_tx, heights_rx) = bounded(limits.max_parallel_block_downloads);
    let (marked_tx, marked_rx) = bounded(limits.max_parallel_block_downloads);
    let (blocks_tx, blocks_rx) = bounded(limits.max_downloaded_block_buffer_size);
    let (pending_tx, pending_rx) = bounded(limits.max_downloaded_receipts_buffer_size);
    let (fetched_tx, fetched_rx) = bounded(limits.max_downloaded_receipts_buffer_size);
    let (classified_tx, classified_rx) = bounded(limits.max_downloaded_receipts_buffer_size);
    let (indexed_tx, indexed_rx) = bounded(limits.write_to_staging_batch_size);
    let (batches_tx, batches_rx) = bounded(limits.max_write_to_staging_batch_buffer_size);

    let mut stages = JoinSet::new();
    stages.spawn(source.produce(
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.state),
        ctx.poll_interval,
        ctx.fetch_retries,
        heights_tx,
        shutdown,
    ));
    stages.spawn(mark_requested(Arc::clone(&ctx), heights_rx, marked_tx));
    stages.spawn(fetch_blocks(Arc::clone(&ctx), marked_rx, blocks_tx));
    stages.spawn(fan_out(Arc::clone(&ctx), blocks_rx, pending_tx));
    stages.spawn(fetch_receipts(Arc::clone(&ctx), pending_rx, fetched_tx));
    stages.spawn(classify(Arc::clone(&ctx), fetched_rx, classified_tx));
    stages.spawn(extract(Arc::clone(&ctx), classified_rx, indexed_tx));
    stages.spawn(async move {
        run_batcher(
            indexed_rx,
            batches_tx,
            limits.write_to_staging_batch_size,
            limits.write_to_staging_batch_max_interval,
        )
        .await;
        Ok(())
    });
    stages.spawn(write_to_staging(ctx, batches_rx));
    stages
}

/// Record every height as requested before it is fetched. A height in the
/// pending reorg set aborts the round so the caller can purge.
async fn mark_requested(
    ctx: Arc<RoundContext>,
    mut rx: mpsc::Receiver<u64>,
    tx: mpsc::Sender<u64>,
) -> IndexerResult<()> {
    while let Some(height) = rx.recv().await {
        if ctx.state.is_reorg(height) {
            warn!(height, "Reached reorged height, stopping round");
            return Err(IndexerError::ReorgDetected { height });
        }
        ctx.repository.mark_requested(height).await?;
        ctx.events.report_start_import(height);
        if tx.send(height).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn fetch_block(ctx: &RoundContext, height: u64) -> IndexerResult<ChainBlock> {
    let what = format!("block {height}");
    with_retries(&what, ctx.fetch_retries, || async move {
        ctx.client
            .block_with_transactions(height)
            .await?
            .ok_or_else(|| IndexerError::rpc(format!("Block {height} not available yet"), None))
    })
    .await
}

async fn fetch_blocks(
    ctx: Arc<RoundContext>,
    rx: mpsc::Receiver<u64>,
    tx: mpsc::Sender<ChainBlock>,
) -> IndexerResult<()> {
    let blocks = receiver_stream(rx)
        .map(|height| {
            let ctx = Arc::clone(&ctx);
            async move { fetch_block(&ctx, height).await }
        })
        .buffer_unordered(ctx.limits.max_parallel_block_downloads.max(1));
    futures_util::pin_mut!(blocks);

    while let Some(block) = blocks.next().await {
        let block = block?;
        debug!(block = block.number, transactions = block.transactions.len(), "Block fetched");
        if tx.send(block).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Split blocks into transactions. Blocks without transactions have nothing
/// to stage and become permanent right away.
async fn fan_out(
    ctx: Arc<RoundContext>,
    mut rx: mpsc::Receiver<ChainBlock>,
    tx: mpsc::Sender<PendingTransaction>,
) -> IndexerResult<()> {
    while let Some(block) = rx.recv().await {
        if block.transactions.is_empty() {
            complete_empty_block(&ctx, &block).await?;
            continue;
        }
        let header = BlockHeader::from(&block);
        for transaction in block.transactions {
            let pending = PendingTransaction {
                block: header,
                transaction,
            };
            if tx.send(pending).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Store an empty block, prune the requests it resolves and report
/// progress. Such blocks never reach a batch.
async fn complete_empty_block(ctx: &RoundContext, block: &ChainBlock) -> IndexerResult<()> {
    ctx.repository.insert_empty_block(block).await?;
    ctx.repository.prune_resolved_requests().await?;
    if let Some(valid) = ctx.repository.last_valid_block().await? {
        ctx.events.report_complete_batch(valid);
    }
    Ok(())
}

/// Receipt of `hash`, `None` once every attempt failed.
async fn fetch_receipt(ctx: &RoundContext, hash: alloy::primitives::B256) -> Option<TxReceipt> {
    let what = format!("receipt {hash}");
    let result = with_retries(&what, ctx.fetch_retries, || async move {
        ctx.client
            .transaction_receipt(hash)
            .await?
            .ok_or_else(|| IndexerError::rpc(format!("Receipt {hash} not available yet"), None))
    })
    .await;

    match result {
        Ok(receipt) => Some(receipt),
        Err(e) => {
            warn!(tx = %hash, error = %e, "Giving up on receipt");
            None
        }
    }
}

async fn fetch_receipts(
    ctx: Arc<RoundContext>,
    rx: mpsc::Receiver<PendingTransaction>,
    tx: mpsc::Sender<FetchedTransaction>,
) -> IndexerResult<()> {
    let fetched = receiver_stream(rx)
        .map(|pending| {
            let ctx = Arc::clone(&ctx);
            async move {
                let receipt = fetch_receipt(&ctx, pending.transaction.hash).await;
                FetchedTransaction {
                    block: pending.block,
                    transaction: pending.transaction,
                    receipt,
                }
            }
        })
        .buffer_unordered(ctx.limits.max_parallel_receipt_downloads.max(1));
    futures_util::pin_mut!(fetched);

    while let Some(item) = fetched.next().await {
        if tx.send(item).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn classify(
    ctx: Arc<RoundContext>,
    mut rx: mpsc::Receiver<FetchedTransaction>,
    tx: mpsc::Sender<ClassifiedTransaction>,
) -> IndexerResult<()> {
    while let Some(fetched) = rx.recv().await {
        let classification = ctx
            .classifier
            .classify(&fetched.transaction, fetched.receipt.as_ref());
        let classified = ClassifiedTransaction {
            fetched,
            classification,
        };
        if tx.send(classified).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn extract(
    ctx: Arc<RoundContext>,
    rx: mpsc::Receiver<ClassifiedTransaction>,
    tx: mpsc::Sender<IndexedTransaction>,
) -> IndexerResult<()> {
    let extracted = receiver_stream(rx)
        .map(|classified| {
            let ctx = Arc::clone(&ctx);
            async move {
                let ClassifiedTransaction {
                    fetched,
                    classification,
                } = classified;
                let details = ctx
                    .extractor
                    .extract(
                        classification,
                        &fetched.transaction,
                        fetched.block.timestamp,
                        fetched.receipt.as_ref(),
                        ctx.client.as_ref(),
                    )
                    .await?;
                Ok::<_, IndexerError>(IndexedTransaction {
                    block: fetched.block,
                    transaction: fetched.transaction,
                    classification,
                    details,
                })
            }
        })
        .buffer_unordered(EXTRACT_PARALLELISM);
    futures_util::pin_mut!(extracted);

    while let Some(item) = extracted.next().await {
        if tx.send(item?).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Stage every batch and promote every `flush_every` batches and once more
/// when the input closes.
async fn write_to_staging(
    ctx: Arc<RoundContext>,
    mut rx: mpsc::Receiver<Vec<IndexedTransaction>>,
) -> IndexerResult<()> {
    let flush_every = ctx.flush_every.max(1);
    let mut staged_batches: u64 = 0;
    let mut highest_staged = None;

    while let Some(batch) = rx.recv().await {
        let written = ctx.staging.write(&batch).await?;
        ctx.state.record_batch(u64::try_from(written).unwrap_or(u64::MAX));
        staged_batches += 1;
        highest_staged = batch
            .iter()
            .map(|item| item.block.number)
            .chain(highest_staged)
            .max();

        if staged_batches % flush_every == 0 {
            flush(&ctx, highest_staged).await?;
        }
    }

    flush(&ctx, highest_staged).await
}

/// Promote complete staged blocks, clean staging and report progress.
#[instrument(skip(ctx))]
async fn flush(ctx: &RoundContext, highest_staged: Option<u64>) -> IndexerResult<()> {
    if let Some(height) = highest_staged {
        ctx.state.record_import_start(height);
    }
    let outcome = ctx.importer.promote(ctx.import_timeout).await?;
    ctx.importer.clean().await?;

    if let Some(valid) = ctx.repository.last_valid_block().await? {
        ctx.events.report_complete_batch(valid);
    }
    ctx.events.notify_new_transactions(&outcome.new_transactions);
    Ok(())
}

/// Delete everything at and above the lowest pending reorg height (or
/// `height`, if lower) and forget the pending heights. Called once every
/// stage of the aborted round has stopped.
///
/// # Errors
///
/// Returns [`IndexerError::DatabaseError`] if the purge fails; the reorg set
/// is kept in that case so the next round tries again.
pub async fn purge_reorg(
    repository: &Repository,
    state: &SharedState,
    height: u64,
) -> IndexerResult<()> {
    let lowest = state
        .pending_reorgs()
        .first()
        .map_or(height, |pending| height.min(*pending));
    let rows = repository.purge_from(lowest).await?;
    state.clear_reorgs();
    info!(height = lowest, rows, "Reorged blocks purged");
    Ok(())
}
