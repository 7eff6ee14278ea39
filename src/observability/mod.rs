//! Structured logging for the indexer.
//!
//! Sets up a `tracing` subscriber with an environment filter, a console layer
//! (pretty for development, JSON for log aggregation) and an optional daily
//! rolling JSON file.
//!
//! # Usage
//!
//! ```no_run
//! use circles_indexer::observability;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Keep the guard alive for the lifetime of the process, otherwise
//! // buffered file output is lost on exit.
//! let _guard = observability::init_tracing(None, None, false)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Environment Configuration
//!
//! ```bash
//! # Component-specific levels
//! RUST_LOG=circles_indexer=debug,sqlx=warn circles-indexer run
//!
//! # JSON console output
//! LOG_JSON=true circles-indexer run
//!
//! # Daily rotated log file
//! LOG_FILE=./logs/indexer.log circles-indexer run
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor an explicit level is given.
pub const DEFAULT_FILTER: &str = "circles_indexer=info,warn";

/// Initialize the global tracing subscriber.
///
/// * `log_level` - filter directive used when `RUST_LOG` is unset
/// * `log_file` - enables a daily rotated JSON log next to this path
/// * `json_output` - JSON console output instead of the pretty format
///
/// Returns the file writer guard when file logging is enabled. Dropping it
/// flushes and stops the background writer.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init_tracing(
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    json_output: bool,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let env_filter = std::env::var("RUST_LOG").map_or_else(
        |_| EnvFilter::new(log_level.as_deref().unwrap_or(DEFAULT_FILTER)),
        EnvFilter::new,
    );

    let console_layer = if json_output {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .boxed()
    };

    let mut guard = None;
    let file_layer = if let Some(ref path) = log_file {
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory)?;

        let appender = tracing_appender::rolling::daily(
            directory,
            path.file_name().unwrap_or_else(|| OsStr::new("indexer.log")),
        );
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);

        Some(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_target(true)
                .with_ansi(false)
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!(
        json_output,
        file_logging = log_file.is_some(),
        "Tracing initialized"
    );

    Ok(guard)
}

/// Install a test-writer subscriber; repeated calls are ignored.
///
/// Run tests with `-- --nocapture` to see the output.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("circles_indexer=debug"))
        .try_init();
}
