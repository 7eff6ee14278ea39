//! Promotion of staged rows into the permanent tables.
//!
//! The import procedure runs in one database transaction:
//!
//! 1. every staged block whose staged transaction count has reached the
//!    block's transaction count is copied into `block`
//! 2. staged transactions of permanent blocks are copied into `transaction_2`
//! 3. staged details of permanent blocks are copied into their tables
//!
//! All copies use `ON CONFLICT DO NOTHING`, so a block is never promoted
//! twice and re-running the procedure is harmless. Incomplete blocks stay in
//! staging until a later batch completes them, which is what keeps unordered
//! staging from leaving gaps.
//!
//! [`Importer::clean`] then drops staged rows that became permanent and
//! prunes resolved entries of `requested_block` unless a hole pins them.

use std::time::{Duration, Instant};

use alloy::primitives::B256;
use tracing::{debug, info, instrument, warn};

use super::models::{
    detail_columns, from_sql_int, staging_table, DETAIL_KEY_COLUMNS, PERMANENT_TABLES,
    TRANSACTION_COLUMNS,
};
use super::repository::{prune_resolved_requests, Repository};
use crate::error::{IndexerError, IndexerResult};
use crate::extract::DetailKind;

/// Attempts per promotion before the round fails.
pub const IMPORT_ATTEMPTS: u32 = 3;

/// Fixed pause between promotion attempts.
pub const IMPORT_RETRY_DELAY: Duration = Duration::from_secs(1);

const PROMOTE_BLOCKS: &str = r#"
    INSERT INTO block (number, hash, timestamp, total_transaction_count,
                       indexed_transaction_count, imported_at)
    SELECT b.number, b.hash, b.timestamp, b.total_transaction_count,
           MIN(COALESCE(t.staged, 0), b.total_transaction_count), ?
    FROM _staging_block b
    LEFT JOIN (
        SELECT block_number, COUNT(DISTINCT hash) AS staged
        FROM _staging_transaction_2
        GROUP BY block_number
    ) t ON t.block_number = b.number
    WHERE COALESCE(t.staged, 0) >= b.total_transaction_count
    ON CONFLICT (number) DO NOTHING
"#;

/// Result of one promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Blocks moved into `block` by this promotion
    pub imported_blocks: u64,
    /// Transactions that became permanent
    pub new_transactions: Vec<B256>,
    /// Highest permanent block afterwards
    pub last_imported: Option<u64>,
}

/// Runs the import procedure and the staging cleanup.
#[derive(Debug, Clone)]
pub struct Importer {
    repository: Repository,
}

fn copy_statement(table: &str, columns: &str, key: &str, returning: Option<&str>) -> String {
    let returning = returning.map(|c| format!(" RETURNING {c}")).unwrap_or_default();
    format!(
        "INSERT INTO {table} ({columns})
         SELECT {columns} FROM {staging}
         WHERE block_number IN (SELECT number FROM block)
         ON CONFLICT ({key}) DO NOTHING{returning}",
        staging = staging_table(table),
    )
}

impl Importer {
    /// Importer over `repository`.
    #[must_use]
    pub const fn new(repository: Repository) -> Self {
        Self { repository }
    }

    /// Promote complete staged blocks, retrying up to [`IMPORT_ATTEMPTS`]
    /// times. Each attempt is bounded by `timeout` and rolled back on failure.
    ///
    /// # Errors
    ///
    /// The last attempt's error: [`IndexerError::DatabaseError`] or
    /// [`IndexerError::Timeout`].
    #[instrument(skip(self), fields(duration_ms = tracing::field::Empty))]
    pub async fn promote(&self, timeout: Duration) -> IndexerResult<ImportOutcome> {
        let start = Instant::now();
        let mut attempt = 1;
        let outcome = loop {
            let result = match tokio::time::timeout(timeout, self.run_procedure()).await {
                Ok(result) => result,
                Err(_) => Err(IndexerError::timeout("import procedure", timeout)),
            };
            match result {
                Ok(outcome) => break outcome,
                Err(e) if attempt < IMPORT_ATTEMPTS => {
                    warn!(attempt, error = %e, "Import failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(IMPORT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        };

        let duration = start.elapsed();
        tracing::Span::current().record(
            "duration_ms",
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        );
        info!(
            blocks = outcome.imported_blocks,
            transactions = outcome.new_transactions.len(),
            last_imported = ?outcome.last_imported,
            duration_ms = duration.as_millis(),
            "Import complete"
        );
        self.log_table_sizes().await;

        Ok(outcome)
    }

    async fn run_procedure(&self) -> IndexerResult<ImportOutcome> {
        let pool = self.repository.pool();
        let mut tx = pool.begin().await.map_err(|e| {
            IndexerError::database("Failed to start import transaction", Some(Box::new(e)))
        })?;

        let imported_blocks = sqlx::query(PROMOTE_BLOCKS)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| IndexerError::database("Failed to promote blocks", Some(Box::new(e))))?
            .rows_affected();

        let statement = copy_statement(
            "transaction_2",
            &TRANSACTION_COLUMNS.join(", "),
            "hash",
            Some("hash"),
        );
        let hashes: Vec<(String,)> = sqlx::query_as(&statement)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| {
                IndexerError::database("Failed to promote transactions", Some(Box::new(e)))
            })?;

        for kind in DetailKind::ALL {
            let columns: Vec<&str> = DETAIL_KEY_COLUMNS
                .iter()
                .chain(detail_columns(kind))
                .copied()
                .collect();
            let statement =
                copy_statement(kind.table(), &columns.join(", "), "hash, log_index", None);
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    IndexerError::database(
                        format!("Failed to promote {}", kind.table()),
                        Some(Box::new(e)),
                    )
                })?;
        }

        let (last,): (Option<i64>,) = sqlx::query_as("SELECT MAX(number) FROM block")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                IndexerError::database("Failed to read highest block", Some(Box::new(e)))
            })?;

        tx.commit().await.map_err(|e| {
            IndexerError::database("Failed to commit import", Some(Box::new(e)))
        })?;

        let new_transactions = hashes
            .into_iter()
            .filter_map(|(hash,)| hash.parse::<B256>().ok())
            .collect();

        Ok(ImportOutcome {
            imported_blocks,
            new_transactions,
            last_imported: last.map(from_sql_int),
        })
    }

    async fn log_table_sizes(&self) {
        match self.repository.database_size_bytes().await {
            Ok(size_bytes) => info!(size_bytes, "Database size"),
            Err(e) => warn!(error = %e, "Could not read database size"),
        }
        match self.repository.table_row_counts().await {
            Ok(counts) => {
                for count in counts {
                    info!(table = %count.table, rows = count.rows, "Table rows");
                }
            }
            Err(e) => warn!(error = %e, "Could not count table rows"),
        }
    }

    /// Delete staged rows of permanent blocks and prune resolved entries of
    /// `requested_block` (see [`Repository::prune_resolved_requests`]).
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if a delete fails.
    #[instrument(skip(self))]
    pub async fn clean(&self) -> IndexerResult<()> {
        let mut tx = self.repository.pool().begin().await.map_err(|e| {
            IndexerError::database("Failed to start cleanup transaction", Some(Box::new(e)))
        })?;

        let mut removed = 0;
        for table in PERMANENT_TABLES {
            let column = if table == "block" { "number" } else { "block_number" };
            let statement = format!(
                "DELETE FROM {} WHERE {column} IN (SELECT number FROM block)",
                staging_table(table)
            );
            removed += sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    IndexerError::database(
                        format!("Failed to clean staging of {table}"),
                        Some(Box::new(e)),
                    )
                })?
                .rows_affected();
        }

        let pruned = prune_resolved_requests(&mut *tx).await?;

        tx.commit().await.map_err(|e| {
            IndexerError::database("Failed to commit cleanup", Some(Box::new(e)))
        })?;

        debug!(staged_rows = removed, requests = pruned, "Staging cleaned");
        Ok(())
    }
}
