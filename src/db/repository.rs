//! Repository for block bookkeeping, resume points and reorg purges.
//!
//! Staging writes live in [`super::staging`], promotion in [`super::import`];
//! this type owns everything else the pipeline asks the store.

use alloy::primitives::B256;
use sqlx::SqlitePool;
use tracing::{debug, info, instrument, warn};

use super::models::{
    from_sql_int, hex_hash, sql_int, staging_table, BlockRecord, TableCount, TransactionRecord,
    PERMANENT_TABLES,
};
use crate::chain::ChainBlock;
use crate::error::{IndexerError, IndexerResult};

/// Repository for database operations.
///
/// Cheap to clone; wraps the process-wide connection pool.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Creates a new repository with the given connection pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== REQUEST TRACKING ====================

    /// Record that `height` is about to be fetched. Idempotent.
    pub async fn mark_requested(&self, height: u64) -> IndexerResult<()> {
        sqlx::query(
            "INSERT INTO requested_block (number, requested_at) VALUES (?, ?)
             ON CONFLICT (number) DO NOTHING",
        )
        .bind(sql_int(height)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            IndexerError::database(
                format!("Failed to mark block {height} as requested"),
                Some(Box::new(e)),
            )
        })?;
        Ok(())
    }

    /// All heights currently recorded as requested, ascending.
    pub async fn requested_heights(&self) -> IndexerResult<Vec<u64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT number FROM requested_block ORDER BY number")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    IndexerError::database("Failed to read requested blocks", Some(Box::new(e)))
                })?;
        Ok(rows.into_iter().map(|(n,)| from_sql_int(n)).collect())
    }

    // ==================== BLOCKS ====================

    /// Store a block without transactions directly as permanent.
    #[instrument(skip(self, block), fields(block = block.number))]
    pub async fn insert_empty_block(&self, block: &ChainBlock) -> IndexerResult<()> {
        sqlx::query(
            "INSERT INTO block (number, hash, timestamp, total_transaction_count,
                                indexed_transaction_count, imported_at)
             VALUES (?, ?, ?, 0, 0, ?)
             ON CONFLICT (number) DO NOTHING",
        )
        .bind(sql_int(block.number)?)
        .bind(hex_hash(&block.hash))
        .bind(sql_int(block.timestamp)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            IndexerError::database(
                format!("Failed to insert empty block {}", block.number),
                Some(Box::new(e)),
            )
        })?;
        debug!("Empty block stored");
        Ok(())
    }

    /// Highest height below which the store is complete.
    ///
    /// `requested_block` holds the outstanding request window. While any
    /// height in it never became permanent, indexing resumes right before
    /// the start of the window; otherwise at the highest permanent block.
    /// `None` on an empty store.
    #[instrument(skip(self))]
    pub async fn last_valid_block(&self) -> IndexerResult<Option<u64>> {
        let (first_gap, window_start): (Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT
                 (SELECT MIN(r.number) FROM requested_block r
                  LEFT JOIN block b ON b.number = r.number
                  WHERE b.number IS NULL),
                 (SELECT MIN(number) FROM requested_block)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            IndexerError::database("Failed to find unresolved requests", Some(Box::new(e)))
        })?;

        if let Some(first_gap) = first_gap {
            let window_start = window_start.unwrap_or(first_gap);
            let resume = from_sql_int(window_start).checked_sub(1);
            debug!(first_gap, window_start, ?resume, "Resuming before the request window");
            return Ok(resume);
        }

        self.max_imported_block().await
    }

    /// Drop resolved requests from the window, unless a resolved height lies
    /// above an unresolved one. A hole keeps the whole window until it is
    /// filled; a tail of requests still in flight does not.
    pub async fn prune_resolved_requests(&self) -> IndexerResult<u64> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            IndexerError::database("Failed to acquire connection", Some(Box::new(e)))
        })?;
        prune_resolved_requests(&mut *conn).await
    }

    /// Highest permanent block.
    pub async fn max_imported_block(&self) -> IndexerResult<Option<u64>> {
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(number) FROM block")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                IndexerError::database("Failed to read highest block", Some(Box::new(e)))
            })?;
        Ok(max.map(from_sql_int))
    }

    /// The `depth` most recent permanent blocks as `(height, hash)`, newest first.
    pub async fn recent_block_hashes(&self, depth: u64) -> IndexerResult<Vec<(u64, B256)>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT number, hash FROM block ORDER BY number DESC LIMIT ?")
                .bind(sql_int(depth)?)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    IndexerError::database("Failed to read recent block hashes", Some(Box::new(e)))
                })?;

        rows.into_iter()
            .map(|(number, hash)| {
                hash.parse::<B256>()
                    .map(|h| (from_sql_int(number), h))
                    .map_err(|e| {
                        IndexerError::database(
                            format!("Stored hash of block {number} is not valid hex"),
                            Some(Box::new(e)),
                        )
                    })
            })
            .collect()
    }

    /// A permanent block by height.
    pub async fn block(&self, height: u64) -> IndexerResult<Option<BlockRecord>> {
        sqlx::query_as::<_, BlockRecord>("SELECT * FROM block WHERE number = ?")
            .bind(sql_int(height)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                IndexerError::database(format!("Failed to read block {height}"), Some(Box::new(e)))
            })
    }

    /// Permanent transactions of a block in block order.
    pub async fn transactions_in_block(
        &self,
        height: u64,
    ) -> IndexerResult<Vec<TransactionRecord>> {
        sqlx::query_as::<_, TransactionRecord>(
            "SELECT * FROM transaction_2 WHERE block_number = ? ORDER BY \"index\"",
        )
        .bind(sql_int(height)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            IndexerError::database(
                format!("Failed to read transactions of block {height}"),
                Some(Box::new(e)),
            )
        })
    }

    // ==================== REORG ====================

    /// Delete every permanent, staged and requested row at or above `height`.
    #[instrument(skip(self))]
    pub async fn purge_from(&self, height: u64) -> IndexerResult<u64> {
        warn!(height, "Purging all data at and above height");

        let mut tx = self.pool.begin().await.map_err(|e| {
            IndexerError::database("Failed to start transaction", Some(Box::new(e)))
        })?;

        let mut deleted = 0;
        for table in PERMANENT_TABLES {
            let column = if table == "block" { "number" } else { "block_number" };
            for target in [table.to_string(), staging_table(table)] {
                let result = sqlx::query(&format!("DELETE FROM {target} WHERE {column} >= ?"))
                    .bind(sql_int(height)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        IndexerError::database(
                            format!("Failed to purge {target} from {height}"),
                            Some(Box::new(e)),
                        )
                    })?;
                deleted += result.rows_affected();
            }
        }

        sqlx::query("DELETE FROM requested_block WHERE number >= ?")
            .bind(sql_int(height)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                IndexerError::database("Failed to purge requested blocks", Some(Box::new(e)))
            })?;

        tx.commit().await.map_err(|e| {
            IndexerError::database("Failed to commit purge", Some(Box::new(e)))
        })?;

        info!(height, rows = deleted, "Purge complete");
        Ok(deleted)
    }

    // ==================== STATISTICS ====================

    /// Row count of every permanent table.
    pub async fn table_row_counts(&self) -> IndexerResult<Vec<TableCount>> {
        let mut counts = Vec::with_capacity(PERMANENT_TABLES.len());
        for table in PERMANENT_TABLES {
            let (rows,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    IndexerError::database(format!("Failed to count {table}"), Some(Box::new(e)))
                })?;
            counts.push(TableCount {
                table: table.to_string(),
                rows,
            });
        }
        Ok(counts)
    }

    /// Size of the database file in bytes.
    pub async fn database_size_bytes(&self) -> IndexerResult<u64> {
        let (size,): (i64,) = sqlx::query_as(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| IndexerError::database("Failed to read database size", Some(Box::new(e))))?;
        Ok(from_sql_int(size))
    }

    /// Health check for database connectivity.
    pub async fn health_check(&self) -> IndexerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                IndexerError::database("Database health check failed", Some(Box::new(e)))
            })?;
        Ok(())
    }
}

const PRUNE_RESOLVED_REQUESTS: &str = "DELETE FROM requested_block
     WHERE number IN (SELECT number FROM block)
       AND NOT EXISTS (
           SELECT 1 FROM requested_block gap
           WHERE gap.number NOT IN (SELECT number FROM block)
             AND gap.number < (SELECT MAX(r.number) FROM requested_block r
                               WHERE r.number IN (SELECT number FROM block)))";

/// Prune resolved requests on `conn`, which may be inside a transaction.
pub(super) async fn prune_resolved_requests(
    conn: &mut sqlx::SqliteConnection,
) -> IndexerResult<u64> {
    let pruned = sqlx::query(PRUNE_RESOLVED_REQUESTS)
        .execute(conn)
        .await
        .map_err(|e| {
            IndexerError::database("Failed to prune requested blocks", Some(Box::new(e)))
        })?
        .rows_affected();
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;

    async fn setup_test_db() -> Repository {
        let pool = create_pool("sqlite::memory:")
            .await
            .expect("Failed to create pool");
        Repository::new(pool)
    }

    fn empty_block(number: u64) -> ChainBlock {
        ChainBlock {
            number,
            hash: B256::with_last_byte(u8::try_from(number % 256).expect("fits")),
            timestamp: 1_700_000_000 + number,
            transactions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_store_has_no_valid_block() {
        let repo = setup_test_db().await;
        assert_eq!(repo.last_valid_block().await.expect("query"), None);
        repo.health_check().await.expect("healthy");
    }

    #[tokio::test]
    async fn test_last_valid_block_stops_before_window_with_hole() {
        let repo = setup_test_db().await;
        for height in 10..=14 {
            repo.mark_requested(height).await.expect("mark");
        }
        for height in [10, 11, 13, 14] {
            repo.insert_empty_block(&empty_block(height))
                .await
                .expect("insert");
        }
        assert_eq!(repo.last_valid_block().await.expect("query"), Some(9));

        // The hole pins the window.
        assert_eq!(repo.prune_resolved_requests().await.expect("prune"), 0);
        assert_eq!(repo.requested_heights().await.expect("query").len(), 5);

        repo.insert_empty_block(&empty_block(12)).await.expect("insert");
        assert_eq!(repo.last_valid_block().await.expect("query"), Some(14));
        assert_eq!(repo.prune_resolved_requests().await.expect("prune"), 5);
        assert!(repo.requested_heights().await.expect("query").is_empty());
        assert_eq!(repo.last_valid_block().await.expect("query"), Some(14));
    }

    #[tokio::test]
    async fn test_prune_keeps_requests_in_flight() {
        let repo = setup_test_db().await;
        for height in 20..=24 {
            repo.mark_requested(height).await.expect("mark");
        }
        for height in 20..=22 {
            repo.insert_empty_block(&empty_block(height))
                .await
                .expect("insert");
        }
        assert_eq!(repo.last_valid_block().await.expect("query"), Some(19));

        assert_eq!(repo.prune_resolved_requests().await.expect("prune"), 3);
        assert_eq!(repo.requested_heights().await.expect("query"), vec![23, 24]);
        assert_eq!(repo.last_valid_block().await.expect("query"), Some(22));
    }

    #[tokio::test]
    async fn test_mark_requested_is_idempotent() {
        let repo = setup_test_db().await;
        repo.mark_requested(5).await.expect("mark");
        repo.mark_requested(5).await.expect("mark again");
        assert_eq!(repo.requested_heights().await.expect("query"), vec![5]);
    }

    #[tokio::test]
    async fn test_recent_block_hashes_newest_first() {
        let repo = setup_test_db().await;
        for height in 1..=5 {
            repo.insert_empty_block(&empty_block(height))
                .await
                .expect("insert");
        }
        let recent = repo.recent_block_hashes(3).await.expect("query");
        let heights: Vec<u64> = recent.iter().map(|(h, _)| *h).collect();
        assert_eq!(heights, vec![5, 4, 3]);
        assert_eq!(recent[0].1, empty_block(5).hash);
    }

    #[tokio::test]
    async fn test_purge_from_removes_blocks_and_requests() {
        let repo = setup_test_db().await;
        for height in 100..=120 {
            repo.mark_requested(height).await.expect("mark");
            repo.insert_empty_block(&empty_block(height))
                .await
                .expect("insert");
        }

        repo.purge_from(110).await.expect("purge");

        assert_eq!(repo.max_imported_block().await.expect("query"), Some(109));
        assert_eq!(repo.last_valid_block().await.expect("query"), Some(109));
        assert!(repo.block(110).await.expect("query").is_none());
        assert_eq!(
            repo.requested_heights().await.expect("query").last(),
            Some(&109)
        );
    }

    #[tokio::test]
    async fn test_table_row_counts_cover_all_tables() {
        let repo = setup_test_db().await;
        repo.insert_empty_block(&empty_block(1)).await.expect("insert");
        let counts = repo.table_row_counts().await.expect("counts");
        assert_eq!(counts.len(), PERMANENT_TABLES.len());
        assert_eq!(counts[0].table, "block");
        assert_eq!(counts[0].rows, 1);
        assert!(repo.database_size_bytes().await.expect("size") > 0);
    }
}
