//! CLI entry point for the Circles indexer.
//!
//! ```text
//! main.rs (runtime + logging)
//!     ↓
//! cli.rs (command dispatch)
//!     ↓
//! indexer (rounds) ─ reorg checker ─ api (optional)
//! ```

use circles_indexer::{cli, observability};
use tracing::error;

/// Entry point.
///
/// Initializes:
/// - Tokio async runtime (via `#[tokio::main]`)
/// - Structured logging with tracing
/// - Environment-based filtering (`RUST_LOG`, `LOG_JSON`, `LOG_FILE`)
///
/// Then delegates to the CLI module.
#[tokio::main]
async fn main() {
    // Examples:
    //   RUST_LOG=debug circles-indexer
    //   RUST_LOG=circles_indexer=trace,sqlx=warn circles-indexer
    //   LOG_JSON=true LOG_FILE=./logs/indexer.log circles-indexer
    let log_level = std::env::var("RUST_LOG").ok();
    let log_file = std::env::var("LOG_FILE").ok().map(std::path::PathBuf::from);
    let json_output = std::env::var("LOG_JSON")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    // Held until exit so buffered file output is flushed.
    let _guard = match observability::init_tracing(log_level, log_file, json_output) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize tracing: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = cli::run().await {
        error!(error = %e, "Application error");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
