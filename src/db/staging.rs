//! Bulk writes of pipeline batches into the staging tables.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use super::models::{
    detail_columns, hex_address, hex_hash, sql_int, staging_table, BlockHeader, Column, DetailRow,
    IndexedTransaction, DETAIL_KEY_COLUMNS, TRANSACTION_COLUMNS,
};
use crate::error::{IndexerError, IndexerResult};
use crate::extract::DetailKind;

/// Upper bound of bind parameters per statement (SQLite allows 32766).
const MAX_BIND_PARAMS: usize = 32_000;

/// Multi-row `INSERT ... ON CONFLICT DO NOTHING`, split into statements that
/// stay below the bind parameter limit.
async fn bulk_insert(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[&str],
    key: &str,
    rows: &[Vec<Column>],
) -> IndexerResult<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
    let mut written = 0;
    for chunk in rows.chunks(rows_per_statement) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO {table} ({}) ", columns.join(", ")));
        builder.push_values(chunk, |mut row_builder, row| {
            for value in row {
                match value {
                    Column::Text(text) => row_builder.push_bind(text.clone()),
                    Column::Int(int) => row_builder.push_bind(*int),
                    Column::Null => row_builder.push_bind(None::<i64>),
                };
            }
        });
        builder.push(format!(" ON CONFLICT ({key}) DO NOTHING"));

        let result = builder.build().execute(&mut *conn).await.map_err(|e| {
            IndexerError::database(format!("Failed to bulk insert into {table}"), Some(Box::new(e)))
        })?;
        written += result.rows_affected();
    }
    Ok(written)
}

fn block_row(block: &BlockHeader) -> IndexerResult<Vec<Column>> {
    Ok(vec![
        Column::Int(sql_int(block.number)?),
        Column::Text(hex_hash(&block.hash)),
        Column::Int(sql_int(block.timestamp)?),
        Column::Int(sql_int(block.transaction_count)?),
    ])
}

fn transaction_row(item: &IndexedTransaction) -> IndexerResult<Vec<Column>> {
    let tx = &item.transaction;
    Ok(vec![
        Column::Text(hex_hash(&tx.hash)),
        Column::Int(sql_int(tx.block_number)?),
        Column::Int(sql_int(tx.transaction_index)?),
        Column::Int(sql_int(item.block.timestamp)?),
        Column::Text(hex_address(&tx.from)),
        tx.to.map_or(Column::Null, |to| Column::Text(hex_address(&to))),
        Column::Text(tx.value.to_string()),
        Column::Text(tx.input.to_string()),
        Column::Int(sql_int(tx.nonce)?),
        tx.tx_type
            .map(sql_int)
            .transpose()?
            .map_or(Column::Null, Column::Int),
        Column::Text(item.classification.to_json()?),
    ])
}

/// Writes batches of indexed transactions into the `_staging_*` tables.
#[derive(Debug, Clone)]
pub struct StagingWriter {
    pool: SqlitePool,
}

impl StagingWriter {
    /// Writer on `pool`.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stage one batch: a deduplicated row per block, one row per
    /// transaction and one row per detail in the table of its kind.
    ///
    /// Re-staging the same batch is a no-op. Returns the number of
    /// transactions in the batch.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DatabaseError`] if any insert fails; nothing
    /// of the batch is kept in that case.
    #[instrument(
        skip(self, batch),
        fields(transactions = batch.len(), duration_ms = tracing::field::Empty)
    )]
    pub async fn write(&self, batch: &[IndexedTransaction]) -> IndexerResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let start = Instant::now();

        let blocks: BTreeMap<u64, Vec<Column>> = batch
            .iter()
            .map(|item| Ok::<_, IndexerError>((item.block.number, block_row(&item.block)?)))
            .collect::<IndexerResult<_>>()?;

        let mut seen = HashSet::with_capacity(batch.len());
        let mut transactions = Vec::with_capacity(batch.len());
        let mut details: HashMap<DetailKind, Vec<Vec<Column>>> = HashMap::new();
        for item in batch {
            if !seen.insert(item.transaction.hash) {
                continue;
            }
            transactions.push(transaction_row(item)?);
            for detail in &item.details {
                let row = DetailRow::try_from(detail)?;
                details.entry(row.kind).or_default().push(row.values);
            }
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            IndexerError::database("Failed to start staging transaction", Some(Box::new(e)))
        })?;

        let block_rows: Vec<Vec<Column>> = blocks.into_values().collect();
        bulk_insert(
            &mut tx,
            &staging_table("block"),
            &["number", "hash", "timestamp", "total_transaction_count"],
            "number",
            &block_rows,
        )
        .await?;

        bulk_insert(
            &mut tx,
            &staging_table("transaction_2"),
            &TRANSACTION_COLUMNS,
            "hash",
            &transactions,
        )
        .await?;

        let mut detail_count = 0;
        for kind in DetailKind::ALL {
            let Some(rows) = details.get(&kind) else {
                continue;
            };
            let columns: Vec<&str> = DETAIL_KEY_COLUMNS
                .iter()
                .chain(detail_columns(kind))
                .copied()
                .collect();
            bulk_insert(
                &mut tx,
                &staging_table(kind.table()),
                &columns,
                "hash, log_index",
                rows,
            )
            .await?;
            detail_count += rows.len();
        }

        tx.commit().await.map_err(|e| {
            IndexerError::database("Failed to commit staging batch", Some(Box::new(e)))
        })?;

        let duration = start.elapsed();
        tracing::Span::current().record(
            "duration_ms",
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        );
        debug!(
            blocks = block_rows.len(),
            transactions = transactions.len(),
            details = detail_count,
            duration_ms = duration.as_millis(),
            "Batch staged"
        );

        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainTransaction;
    use crate::classify::{ClassificationSet, TransactionClass};
    use crate::db::create_pool;
    use alloy::primitives::{Address, Bytes, B256, U256};

    fn item(block: u64, index: u64) -> IndexedTransaction {
        let hash = B256::from(U256::from(block * 1_000 + index));
        IndexedTransaction {
            block: BlockHeader {
                number: block,
                hash: B256::with_last_byte(7),
                timestamp: 1_700_000_000,
                transaction_count: 2,
            },
            transaction: ChainTransaction {
                hash,
                block_number: block,
                transaction_index: index,
                from: Address::repeat_byte(1),
                to: Some(Address::repeat_byte(2)),
                value: U256::from(10_u64),
                input: Bytes::new(),
                nonce: index,
                tx_type: Some(2),
            },
            classification: [TransactionClass::EoaEthTransfer]
                .into_iter()
                .collect::<ClassificationSet>(),
            details: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_write_is_idempotent() {
        let pool = create_pool("sqlite::memory:").await.expect("pool");
        let writer = StagingWriter::new(pool.clone());
        let batch = vec![item(5, 0), item(5, 1), item(6, 0)];

        assert_eq!(writer.write(&batch).await.expect("write"), 3);
        writer.write(&batch).await.expect("rewrite");

        let (blocks,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _staging_block")
            .fetch_one(&pool)
            .await
            .expect("count");
        let (txs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _staging_transaction_2")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(blocks, 2);
        assert_eq!(txs, 3);
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let pool = create_pool("sqlite::memory:").await.expect("pool");
        let writer = StagingWriter::new(pool);
        assert_eq!(writer.write(&[]).await.expect("write"), 0);
    }
}
