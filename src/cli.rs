//! Command-line interface for the Circles indexer.
//!
//! # Commands
//!
//! - `run` (default): index continuously until Ctrl-C
//! - `status`: print the last valid block, the chain head and the lag
//! - `purge --from <height>`: delete everything at and above a height
//!
//! # Example
//!
//! ```bash
//! circles-indexer
//! circles-indexer status
//! circles-indexer purge --from 31000000
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::run_server;
use crate::app_state::AppState;
use crate::chain::{ChainClient, ChainConnector};
use crate::config::Config;
use crate::db::{create_pool, Repository};
use crate::error::IndexerResult;
use crate::health::HealthMonitor;
use crate::indexer::{Indexer, SharedState};
use crate::reorg::ReorgChecker;
use crate::rpc::{redact_url, AlloyChainClient, AlloyConnector};

/// Circles UBI transaction indexer
#[derive(Parser, Debug)]
#[command(name = "circles-indexer")]
#[command(about = "Staged, reorg-aware indexer for Circles UBI transactions", long_about = None)]
#[command(version)]
struct Cli {
    /// Subcommand to execute (default: run)
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Index the chain continuously
    Run,

    /// Show indexing progress against the chain head
    Status,

    /// Delete all indexed data at and above a height
    Purge {
        /// First height to delete
        #[arg(long)]
        from: u64,
    },
}

/// Parse CLI arguments and execute the appropriate command.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration loading fails
/// - The database cannot be opened
/// - Command execution fails
pub async fn run() -> IndexerResult<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_indexer(config).await,
        Commands::Status => run_status_command(&config).await,
        Commands::Purge { from } => run_purge_command(&config, from).await,
    }
}

/// Start the reorg checker, the optional HTTP server and the round loop.
async fn run_indexer(config: Config) -> IndexerResult<()> {
    info!(rpc = redact_url(config.rpc_url()), "Starting indexer");
    let pool = create_pool(config.connection_string()).await?;
    let repository = Repository::new(pool.clone());

    let state = Arc::new(SharedState::new());
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&state),
        config.health_max_request_repeats(),
        config.health_stale_after(),
    ));
    let connector: Arc<dyn ChainConnector> = Arc::new(AlloyConnector::new(config.rpc_url()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                println!("{}", "Shutting down gracefully...".yellow().bold());
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let checker = ReorgChecker::new(repository.clone(), config.reorg_check_depth());
    let reorg_task = tokio::spawn(checker.run(
        Arc::clone(&connector),
        Arc::clone(&state),
        config.reorg_check_interval(),
        shutdown_rx.clone(),
    ));

    let server_task = config.http_port().map(|port| {
        let app_state = AppState::new(repository.clone(), Arc::clone(&monitor));
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_server(app_state, port, shutdown).await {
                error!(error = %e, port, "API server failed");
            }
        })
    });

    let indexer = Indexer::new(config, pool, connector, state, monitor);
    let result = indexer.run(shutdown_rx).await;

    if let Err(e) = reorg_task.await {
        warn!(error = %e, "Reorg checker ended abnormally");
    }
    if let Some(task) = server_task {
        if let Err(e) = task.await {
            warn!(error = %e, "API server ended abnormally");
        }
    }

    if result.is_ok() {
        println!("{}", "Shutdown complete".green().bold());
    }
    result
}

/// Print the last valid block, the chain head and the lag between them.
async fn run_status_command(config: &Config) -> IndexerResult<()> {
    let pool = create_pool(config.connection_string()).await?;
    let repository = Repository::new(pool);
    let client = AlloyChainClient::connect(config.rpc_url())?;

    let last_valid = repository.last_valid_block().await?;
    let head = client.chain_height().await?;
    let requested = repository.requested_heights().await?;
    let counts = repository.table_row_counts().await?;

    println!();
    println!("{}", "Circles Indexer Status".cyan().bold());
    println!("{}", "─".repeat(40).dimmed());
    match last_valid {
        Some(block) => {
            let lag = head.saturating_sub(block);
            let lag_text = format!("{lag} blocks");
            let lag_colored = if lag <= config.bulk_threshold() {
                lag_text.green()
            } else {
                lag_text.yellow()
            };
            println!("{:<20} {}", "Last valid block:".bold(), block.to_string().green());
            println!("{:<20} {}", "Chain head:".bold(), head);
            println!("{:<20} {}", "Lag:".bold(), lag_colored);
        }
        None => {
            println!("{:<20} {}", "Last valid block:".bold(), "none".yellow());
            println!("{:<20} {}", "Chain head:".bold(), head);
        }
    }
    println!("{:<20} {}", "Open requests:".bold(), requested.len());
    println!();
    for count in counts {
        println!("  {:<28} {:>12}", count.table.dimmed(), count.rows);
    }
    println!();

    Ok(())
}

/// Delete every row at and above `from`.
async fn run_purge_command(config: &Config, from: u64) -> IndexerResult<()> {
    let pool = create_pool(config.connection_string()).await?;
    let repository = Repository::new(pool);

    warn!(from, "Manual purge requested");
    let rows = repository.purge_from(from).await?;
    println!(
        "{} Deleted {} rows at and above block {}",
        "✅".green(),
        rows,
        from.to_string().bold()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_is_the_default() {
        let cli = Cli::try_parse_from(["circles-indexer"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_purge_requires_height() {
        assert!(Cli::try_parse_from(["circles-indexer", "purge"]).is_err());
        let cli =
            Cli::try_parse_from(["circles-indexer", "purge", "--from", "110"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Purge { from: 110 })));
    }
}
