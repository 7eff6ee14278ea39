//! End-to-end tests of indexing rounds against an in-memory chain.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use circles_indexer::classify::TransactionClass;
use circles_indexer::config::Config;
use circles_indexer::db::{create_pool, Repository};
use circles_indexer::error::IndexerError;
use circles_indexer::health::{HealthMonitor, IndexerEvents};
use circles_indexer::indexer::{pipeline, Indexer, RoundOutcome, SharedState};

use common::*;

struct Harness {
    chain: Arc<MockChain>,
    repository: Repository,
    state: Arc<SharedState>,
    monitor: Arc<HealthMonitor>,
    indexer: Arc<Indexer>,
}

async fn harness(config: Config) -> Harness {
    let pool = create_pool("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    let chain = MockChain::new();
    let state = Arc::new(SharedState::new());
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&state),
        5,
        Duration::from_secs(120),
    ));
    let indexer = Indexer::new(
        config,
        pool.clone(),
        Arc::new(MockConnector(Arc::clone(&chain))),
        Arc::clone(&state),
        Arc::clone(&monitor) as Arc<dyn IndexerEvents>,
    );
    Harness {
        chain,
        repository: Repository::new(pool),
        state,
        monitor,
        indexer: Arc::new(indexer),
    }
}

fn catch_up_config() -> Config {
    test_config(&[("START_FROM_BLOCK", "100")])
}

/// Blocks 100..=110: transfers, a signup and a hub transfer among empty blocks.
fn populate(chain: &MockChain) {
    chain.put_empty_blocks(100..=110, 0);

    let transfers = vec![
        eth_transfer(100, 0, addr(1), addr(2), wei(1)),
        eth_transfer(100, 1, addr(2), addr(3), wei(2)),
    ];
    for tx in &transfers {
        chain.put_receipt(receipt(tx, Vec::new()));
    }
    chain.put_block(block(100, 0, transfers));

    let user = addr(0x51);
    let signup = contract_call(102, 0, user, HUB);
    chain.put_receipt(receipt(&signup, signup_logs(user, addr(0x52), wei(50))));
    chain.set_owners(user, vec![addr(0x61)]);
    chain.put_block(block(102, 0, vec![signup]));

    let hub = contract_call(104, 0, addr(1), HUB);
    chain.put_receipt(receipt(
        &hub,
        vec![
            erc20_transfer_log(addr(0xee), addr(1), addr(2), wei(3), 0),
            hub_transfer_log(addr(1), addr(2), wei(3), 1),
        ],
    ));
    chain.put_block(block(104, 0, vec![hub]));
}

async fn count(repository: &Repository, table: &str) -> i64 {
    repository
        .table_row_counts()
        .await
        .expect("counts")
        .into_iter()
        .find(|c| c.table == table)
        .map(|c| c.rows)
        .expect("table listed")
}

#[tokio::test]
async fn test_catch_up_round_indexes_every_block() {
    let h = harness(catch_up_config()).await;
    populate(&h.chain);
    let mut notifications = h.monitor.subscribe();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let outcome = h.indexer.run_round(shutdown_rx).await.expect("round succeeds");
    assert_eq!(outcome, RoundOutcome::Completed);

    assert_eq!(h.repository.last_valid_block().await.expect("read"), Some(110));
    for height in 100..=110 {
        let stored = h.repository.block(height).await.expect("read").expect("block stored");
        assert_eq!(stored.hash, format!("{:#x}", block_hash(height, 0)));
    }

    let transfers = h.repository.transactions_in_block(100).await.expect("read");
    assert_eq!(transfers.len(), 2);
    assert!(transfers
        .iter()
        .all(|t| t.classification.contains(TransactionClass::EoaEthTransfer.name())));
    assert_eq!(count(&h.repository, "eth_transfer").await, 2);
    assert_eq!(count(&h.repository, "crc_signup").await, 1);
    assert_eq!(count(&h.repository, "crc_trust").await, 1);
    assert_eq!(count(&h.repository, "crc_hub_transfer").await, 1);
    assert_eq!(count(&h.repository, "erc20_transfer").await, 2);
    assert_eq!(count(&h.repository, "transaction_2").await, 4);

    let mut announced = Vec::new();
    while let Ok(hash) = notifications.try_recv() {
        announced.push(hash);
    }
    assert_eq!(announced.len(), 4);
    assert!(announced.contains(&tx_hash(102, 0)));

    let report = h.monitor.report();
    assert!(report.healthy, "unexpected reasons: {:?}", report.reasons);
    assert_eq!(report.stats.last_imported, Some(110));
    assert_eq!(report.stats.transactions, 4);
    assert_eq!(report.stats.rounds, 1);
}

#[tokio::test]
async fn test_second_round_resumes_after_last_block() {
    let h = harness(catch_up_config()).await;
    populate(&h.chain);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    h.indexer
        .run_round(shutdown_rx.clone())
        .await
        .expect("first round");

    h.chain.put_empty_blocks(111..=120, 0);
    let late = eth_transfer(115, 0, addr(7), addr(8), wei(9));
    h.chain.put_receipt(receipt(&late, Vec::new()));
    h.chain.put_block(block(115, 0, vec![late]));

    h.indexer.run_round(shutdown_rx).await.expect("second round");
    assert_eq!(h.repository.last_valid_block().await.expect("read"), Some(120));
    assert_eq!(count(&h.repository, "transaction_2").await, 5);
    // Block 100 was not fetched again, so nothing was duplicated or re-staged.
    assert_eq!(h.repository.transactions_in_block(100).await.expect("read").len(), 2);
}

#[tokio::test]
async fn test_unavailable_receipt_stores_unknown_transaction() {
    let h = harness(catch_up_config()).await;
    h.chain.put_empty_blocks(100..=105, 0);
    let lost = eth_transfer(101, 0, addr(1), addr(2), wei(1));
    h.chain.fail_receipt(lost.hash);
    h.chain.put_block(block(101, 0, vec![lost.clone()]));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    h.indexer.run_round(shutdown_rx).await.expect("round succeeds");

    let stored = h.repository.transactions_in_block(101).await.expect("read");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].hash, format!("{:#x}", lost.hash));
    assert_eq!(stored[0].classification, r#"["Unknown"]"#);
    assert_eq!(count(&h.repository, "eth_transfer").await, 0);
}

#[tokio::test]
async fn test_missing_block_fails_round() {
    let h = harness(catch_up_config()).await;
    h.chain.put_empty_blocks(100..=103, 0);
    h.chain.put_empty_blocks(105..=110, 0);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = h.indexer.run_round(shutdown_rx.clone()).await;
    assert!(matches!(result, Err(IndexerError::RpcError { .. })));
    // Blocks after the hole may already be stored; the resume point stays
    // before it either way.
    let resume = h.repository.last_valid_block().await.expect("read");
    assert!(resume < Some(104), "resumes at {resume:?}");

    h.chain.put_block(block(104, 0, Vec::new()));
    h.indexer.run_round(shutdown_rx).await.expect("round succeeds");
    assert_eq!(h.repository.last_valid_block().await.expect("read"), Some(110));
    for height in 100..=110 {
        assert!(h.repository.block(height).await.expect("read").is_some());
    }
}

#[tokio::test]
async fn test_single_eoa_transfer_round() {
    let h = harness(test_config(&[("START_FROM_BLOCK", "100"), ("BULK_THRESHOLD", "0")])).await;
    let transfer = eth_transfer(100, 0, addr(1), addr(2), wei(1));
    h.chain.put_receipt(receipt(&transfer, Vec::new()));
    h.chain.put_block(block(100, 0, vec![transfer.clone()]));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let outcome = h.indexer.run_round(shutdown_rx).await.expect("round succeeds");
    assert_eq!(outcome, RoundOutcome::Completed);

    let stored = h.repository.transactions_in_block(100).await.expect("read");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].hash, format!("{:#x}", transfer.hash));
    assert_eq!(stored[0].classification, r#"["EoaEthTransfer"]"#);

    assert_eq!(count(&h.repository, "transaction_2").await, 1);
    assert_eq!(count(&h.repository, "eth_transfer").await, 1);
    let counts = h.repository.table_row_counts().await.expect("counts");
    let circles: Vec<_> = counts.iter().filter(|c| c.table.starts_with("crc_")).collect();
    assert_eq!(circles.len(), 4);
    assert!(circles.iter().all(|c| c.rows == 0), "{circles:?}");
    assert_eq!(count(&h.repository, "erc20_transfer").await, 0);
    assert_eq!(count(&h.repository, "gnosis_safe_eth_transfer").await, 0);
}

#[tokio::test]
async fn test_purge_then_reindex_switches_branch() {
    let h = harness(catch_up_config()).await;
    populate(&h.chain);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    h.indexer
        .run_round(shutdown_rx.clone())
        .await
        .expect("first round");

    // The chain switches to another branch from 105 on.
    h.chain.put_empty_blocks(105..=112, 1);
    h.state.push_reorg(105);

    // Purging happens before the next round; then 105.. is indexed again.
    pipeline::purge_reorg(&h.repository, &h.state, 105)
        .await
        .expect("purge");
    assert!(h.state.pending_reorgs().is_empty());
    assert_eq!(h.repository.last_valid_block().await.expect("read"), Some(104));

    h.indexer.run_round(shutdown_rx).await.expect("second round");
    assert_eq!(h.repository.last_valid_block().await.expect("read"), Some(112));
    let replaced = h.repository.block(105).await.expect("read").expect("stored");
    assert_eq!(replaced.hash, format!("{:#x}", block_hash(105, 1)));
    assert_eq!(h.state.snapshot().reorgs, 1);
}

#[tokio::test]
async fn test_round_reaching_reorg_height_aborts() {
    let h = harness(catch_up_config()).await;
    populate(&h.chain);
    h.state.push_reorg(103);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = h.indexer.run_round(shutdown_rx).await;
    assert!(matches!(result, Err(IndexerError::ReorgDetected { height: 103 })));
    // Nothing at or above the reorged height was requested.
    assert!(h
        .repository
        .requested_heights()
        .await
        .expect("read")
        .iter()
        .all(|height| *height < 103));
}

#[tokio::test]
async fn test_run_follows_live_head_until_shutdown() {
    let config = test_config(&[
        ("START_FROM_BLOCK", "100"),
        ("BULK_THRESHOLD", "24"),
        ("WRITE_TO_STAGING_BATCH_MAX_INTERVAL_SECS", "1"),
    ]);
    let h = harness(config).await;
    for height in 100..=101 {
        let tx = eth_transfer(height, 0, addr(1), addr(2), wei(height));
        h.chain.put_receipt(receipt(&tx, Vec::new()));
        h.chain.put_block(block(height, 0, vec![tx]));
    }
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let indexer = Arc::clone(&h.indexer);
    let running = tokio::spawn(async move { indexer.run(shutdown_rx).await });

    wait_for_block(&h.repository, 101).await;

    let tx = eth_transfer(102, 0, addr(3), addr(4), wei(5));
    h.chain.put_receipt(receipt(&tx, Vec::new()));
    h.chain.put_block(block(102, 0, vec![tx.clone()]));
    wait_for_block(&h.repository, 102).await;

    shutdown_tx.send(true).expect("indexer listening");
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("indexer stops after shutdown")
        .expect("task not panicked")
        .expect("clean shutdown");

    let stored = h.repository.transactions_in_block(102).await.expect("read");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].hash, format!("{:#x}", tx.hash));
    assert_eq!(h.state.snapshot().errors, 0);
}

#[tokio::test]
async fn test_live_empty_blocks_keep_indexer_healthy() {
    let config = test_config(&[("START_FROM_BLOCK", "100"), ("BULK_THRESHOLD", "24")]);
    let h = harness(config).await;
    h.chain.put_empty_blocks(100..=103, 0);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let indexer = Arc::clone(&h.indexer);
    let running = tokio::spawn(async move { indexer.run(shutdown_rx).await });

    // No transaction ever reaches a batch, yet progress is reported and the
    // resolved requests are pruned.
    let (repo, monitor) = (&h.repository, &h.monitor);
    wait_until(move || async move {
        repo.last_valid_block().await.expect("read") == Some(103)
            && repo.requested_heights().await.expect("read").is_empty()
            && monitor.report().healthy
    })
    .await;
    assert_eq!(h.monitor.report().stats.last_imported, Some(103));
    assert_eq!(h.state.snapshot().batches, 0);

    shutdown_tx.send(true).expect("indexer listening");
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("indexer stops after shutdown")
        .expect("task not panicked")
        .expect("clean shutdown");
}

async fn wait_for_block(repository: &Repository, height: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if repository.last_valid_block().await.expect("read") >= Some(height) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "block {height} was not indexed in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
