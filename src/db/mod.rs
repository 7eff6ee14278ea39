//! Persistent storage of indexed blocks, transactions and details.
//!
//! # Architecture
//!
//! - `models`: row types and the column layout of every table
//! - `repository`: request bookkeeping, resume point, reorg purge, statistics
//! - `staging`: bulk writes of pipeline batches into the `_staging_*` tables
//! - `import`: promotion of complete staged blocks and cleanup
//!
//! SQLite runs in WAL mode so the status command and the health endpoint can
//! read while the pipeline writes. In-memory databases are private to their
//! connection, so their pool is pinned to a single long-lived connection.

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{IndexerError, IndexerResult};

pub mod import;
pub mod models;
pub mod repository;
pub mod staging;

pub use import::Importer;
pub use repository::Repository;
pub use staging::StagingWriter;

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Creates a SQLite connection pool and applies migrations.
///
/// # Configuration
///
/// - **WAL mode**: concurrent readers during writes
/// - **Busy timeout**: 30 seconds to ride out lock contention
/// - **Connections**: 5 for files, exactly 1 for in-memory databases
///
/// # Errors
///
/// Returns [`IndexerError::DatabaseError`] if the URL is invalid, the
/// database cannot be opened or a migration fails.
///
/// # Example
///
/// ```no_run
/// use circles_indexer::db::create_pool;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = create_pool("sqlite:./indexer.db").await?;
///     Ok(())
/// }
/// ```
pub async fn create_pool(database_url: &str) -> IndexerResult<SqlitePool> {
    info!(database_url, "Connecting to database");

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| {
            IndexerError::database(
                format!("Failed to parse database URL: {database_url}"),
                Some(Box::new(e)),
            )
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool_options = if is_in_memory(database_url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5).min_connections(1)
    };

    let pool = pool_options
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .map_err(|e| {
            IndexerError::database(
                format!("Failed to connect to database at {database_url}"),
                Some(Box::new(e)),
            )
        })?;

    info!("Running database migrations");
    run_migrations(&pool).await?;
    verify_database(&pool).await?;
    info!("Database migrations complete");

    Ok(pool)
}

/// Applies all pending migrations from `migrations/`.
///
/// # Errors
///
/// Returns [`IndexerError::DatabaseError`] if a migration fails.
pub async fn run_migrations(pool: &SqlitePool) -> IndexerResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| IndexerError::database("Failed to run database migrations", Some(Box::new(e))))
}

/// Verify that every permanent table and its staging twin exist.
///
/// # Errors
///
/// Returns [`IndexerError::DatabaseError`] if a table is missing.
pub async fn verify_database(pool: &SqlitePool) -> IndexerResult<()> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
        .fetch_all(pool)
        .await
        .map_err(|e| {
            IndexerError::database("Failed to verify database schema", Some(Box::new(e)))
        })?;
    let existing: Vec<String> = rows.into_iter().map(|(name,)| name).collect();

    let missing: Vec<String> = models::PERMANENT_TABLES
        .iter()
        .flat_map(|table| [(*table).to_string(), models::staging_table(table)])
        .chain(std::iter::once("requested_block".to_string()))
        .filter(|table| !existing.contains(table))
        .collect();

    if !missing.is_empty() {
        return Err(IndexerError::database(
            format!("Database schema incomplete, missing: {}", missing.join(", ")),
            None,
        ));
    }
    Ok(())
}
