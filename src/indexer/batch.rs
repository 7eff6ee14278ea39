//! Size- and time-bounded batching between the extract and staging stages.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Collect items from `rx` into batches sent to `tx`.
///
/// A batch closes when it holds `max_items` items or when `max_interval`
/// passes with at least one item buffered. The remainder is sent when `rx`
/// closes. Returns early if `tx` is closed.
pub async fn run_batcher<T: Send>(
    mut rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<Vec<T>>,
    max_items: usize,
    max_interval: Duration,
) {
    let max_items = max_items.max(1);
    let mut buffer: Vec<T> = Vec::with_capacity(max_items);
    let mut ticker = tokio::time::interval(max_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            item = rx.recv() => {
                let Some(item) = item else {
                    break;
                };
                buffer.push(item);
                if buffer.len() >= max_items {
                    trace!(items = buffer.len(), "Batch full");
                    let batch = std::mem::replace(&mut buffer, Vec::with_capacity(max_items));
                    if tx.send(batch).await.is_err() {
                        return;
                    }
                    ticker.reset();
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    trace!(items = buffer.len(), "Batch interval elapsed");
                    let batch = std::mem::replace(&mut buffer, Vec::with_capacity(max_items));
                    if tx.send(batch).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    if !buffer.is_empty() {
        let _ = tx.send(buffer).await;
    }
}
