//! Configuration management for the Circles indexer.
//!
//! Configuration is read from environment variables (optionally seeded from a
//! `.env` file through `dotenvy`). Every value is parsed up front and all
//! failures are collected, so a misconfigured deployment reports every bad
//! setting at once instead of one per restart.
//!
//! ## Environment Variables
//!
//! Required:
//! - `CONNECTION_STRING`: sqlx SQLite URL (e.g. `sqlite:./indexer.db`)
//! - `RPC_URL`: HTTP(S) JSON-RPC endpoint of the node
//!
//! Optional (with defaults):
//! - `HUB_ADDRESS`: Circles hub contract (default: Gnosis chain hub)
//! - `START_FROM_BLOCK`: first height to index on an empty store (default: 0)
//! - `BULK_THRESHOLD`: lag above which a round runs in catch-up mode (default: 24)
//! - `LIVE_POLL_INTERVAL_MS`, `REORG_CHECK_INTERVAL_SECS`, `REORG_CHECK_DEPTH`
//! - `MAX_PARALLEL_BLOCK_DOWNLOADS`, `MAX_DOWNLOADED_BLOCK_BUFFER_SIZE`
//! - `MAX_PARALLEL_RECEIPT_DOWNLOADS`, `MAX_DOWNLOADED_RECEIPTS_BUFFER_SIZE`
//! - `WRITE_TO_STAGING_BATCH_SIZE`, `WRITE_TO_STAGING_BATCH_MAX_INTERVAL_SECS`
//! - `MAX_WRITE_TO_STAGING_BATCH_BUFFER_SIZE`
//! - `FLUSH_EVERY_NTH_BATCH_BULK`, `FLUSH_EVERY_NTH_BATCH_LIVE`
//! - `IMPORT_TIMEOUT_BULK_SECS`, `IMPORT_TIMEOUT_LIVE_SECS`
//! - `RPC_FETCH_RETRIES`, `ERROR_BASE_PENALTY_MS`, `ERROR_MAX_PENALTY_MS`
//! - `STATS_REPORT_INTERVAL_SECS`, `HEALTH_MAX_REQUEST_REPEATS`, `HEALTH_STALE_AFTER_SECS`
//! - `HTTP_PORT`: serve `/health` and `/stream` when set
//!
//! ## Example
//!
//! ```no_run
//! use circles_indexer::config::Config;
//! use circles_indexer::error::IndexerResult;
//!
//! # fn main() -> IndexerResult<()> {
//! let config = Config::from_env()?;
//! println!("RPC URL: {}", config.rpc_url());
//! # Ok(())
//! # }
//! ```

use alloy::primitives::{address, Address};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IndexerError, IndexerResult};

/// Circles UBI hub contract on Gnosis chain.
pub const DEFAULT_HUB_ADDRESS: Address = address!("29b9a7fBb8995b2423a71cC17cf9810798F6C543");

/// Concurrency and buffering limits for the pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineLimits {
    /// Concurrent `eth_getBlockByNumber` requests
    pub max_parallel_block_downloads: usize,
    /// Capacity of the downloaded-block channel
    pub max_downloaded_block_buffer_size: usize,
    /// Concurrent receipt requests
    pub max_parallel_receipt_downloads: usize,
    /// Capacity of the downloaded-receipt channel
    pub max_downloaded_receipts_buffer_size: usize,
    /// Items per staging batch
    pub write_to_staging_batch_size: usize,
    /// Maximum age of an open staging batch
    pub write_to_staging_batch_max_interval: Duration,
    /// Capacity of the closed-batch channel
    pub max_write_to_staging_batch_buffer_size: usize,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            max_parallel_block_downloads: 8,
            max_downloaded_block_buffer_size: 32,
            max_parallel_receipt_downloads: 32,
            max_downloaded_receipts_buffer_size: 512,
            write_to_staging_batch_size: 1024,
            write_to_staging_batch_max_interval: Duration::from_secs(1),
            max_write_to_staging_batch_buffer_size: 8,
        }
    }
}

/// Main configuration struct for the indexer.
#[derive(Debug, Clone)]
pub struct Config {
    connection_string: String,
    rpc_url: String,
    hub_address: Address,
    start_from_block: u64,
    bulk_threshold: u64,
    live_poll_interval: Duration,
    reorg_check_interval: Duration,
    reorg_check_depth: u64,
    limits: PipelineLimits,
    flush_every_nth_batch_bulk: u64,
    flush_every_nth_batch_live: u64,
    import_timeout_bulk: Duration,
    import_timeout_live: Duration,
    rpc_fetch_retries: u32,
    error_base_penalty: Duration,
    error_max_penalty: Duration,
    stats_report_interval: Duration,
    health_max_request_repeats: u32,
    health_stale_after: Duration,
    http_port: Option<u16>,
}

/// Collects parse failures while reading settings.
struct Reader<F> {
    lookup: F,
    errors: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn required(&mut self, key: &str) -> String {
        match (self.lookup)(key) {
            Some(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => {
                self.errors.push(format!("{key} is required"));
                String::new()
            }
        }
    }

    fn parsed<T>(&mut self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            None => default,
            Some(raw) if raw.trim().is_empty() => default,
            Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|e| {
                self.errors.push(format!("{key} has invalid value '{raw}': {e}"));
                default
            }),
        }
    }

    fn positive(&mut self, key: &str, default: u64) -> u64 {
        let value = self.parsed(key, default);
        if value == 0 {
            self.errors.push(format!("{key} must be greater than zero"));
            return default;
        }
        value
    }

    fn optional<T>(&mut self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = (self.lookup)(key)?;
        if raw.trim().is_empty() {
            return None;
        }
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(e) => {
                self.errors.push(format!("{key} has invalid value '{raw}': {e}"));
                None
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn as_usize(value: u64) -> usize {
    value as usize
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Loads `.env` first when present.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::ConfigError`] listing every missing or invalid
    /// setting.
    pub fn from_env() -> IndexerResult<Self> {
        // Load .env file if present (ignore error if file doesn't exist)
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key/value lookup.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::ConfigError`] listing every missing or invalid
    /// setting.
    pub fn from_lookup<F>(lookup: F) -> IndexerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut r = Reader {
            lookup,
            errors: Vec::new(),
        };

        let connection_string = r.required("CONNECTION_STRING");
        if !connection_string.is_empty() && !connection_string.starts_with("sqlite:") {
            r.errors.push(format!(
                "CONNECTION_STRING must be a sqlite URL, got: {connection_string}"
            ));
        }

        let rpc_url = r.required("RPC_URL");
        if !rpc_url.is_empty() && !rpc_url.starts_with("http") {
            r.errors
                .push(format!("RPC_URL must be an http(s) URL, got: {rpc_url}"));
        }

        let hub_address = r.parsed("HUB_ADDRESS", DEFAULT_HUB_ADDRESS);
        let start_from_block = r.parsed("START_FROM_BLOCK", 0_u64);
        let bulk_threshold = r.parsed("BULK_THRESHOLD", 24_u64);
        let live_poll_interval = Duration::from_millis(r.positive("LIVE_POLL_INTERVAL_MS", 2_000));
        let reorg_check_interval =
            Duration::from_secs(r.positive("REORG_CHECK_INTERVAL_SECS", 60));
        let reorg_check_depth = r.positive("REORG_CHECK_DEPTH", 18);

        let defaults = PipelineLimits::default();
        let limits = PipelineLimits {
            max_parallel_block_downloads: as_usize(r.positive(
                "MAX_PARALLEL_BLOCK_DOWNLOADS",
                defaults.max_parallel_block_downloads as u64,
            )),
            max_downloaded_block_buffer_size: as_usize(r.positive(
                "MAX_DOWNLOADED_BLOCK_BUFFER_SIZE",
                defaults.max_downloaded_block_buffer_size as u64,
            )),
            max_parallel_receipt_downloads: as_usize(r.positive(
                "MAX_PARALLEL_RECEIPT_DOWNLOADS",
                defaults.max_parallel_receipt_downloads as u64,
            )),
            max_downloaded_receipts_buffer_size: as_usize(r.positive(
                "MAX_DOWNLOADED_RECEIPTS_BUFFER_SIZE",
                defaults.max_downloaded_receipts_buffer_size as u64,
            )),
            write_to_staging_batch_size: as_usize(r.positive(
                "WRITE_TO_STAGING_BATCH_SIZE",
                defaults.write_to_staging_batch_size as u64,
            )),
            write_to_staging_batch_max_interval: Duration::from_secs(r.positive(
                "WRITE_TO_STAGING_BATCH_MAX_INTERVAL_SECS",
                defaults.write_to_staging_batch_max_interval.as_secs(),
            )),
            max_write_to_staging_batch_buffer_size: as_usize(r.positive(
                "MAX_WRITE_TO_STAGING_BATCH_BUFFER_SIZE",
                defaults.max_write_to_staging_batch_buffer_size as u64,
            )),
        };

        let flush_every_nth_batch_bulk = r.positive("FLUSH_EVERY_NTH_BATCH_BULK", 64);
        let flush_every_nth_batch_live = r.positive("FLUSH_EVERY_NTH_BATCH_LIVE", 1);
        let import_timeout_bulk = Duration::from_secs(r.positive("IMPORT_TIMEOUT_BULK_SECS", 600));
        let import_timeout_live = Duration::from_secs(r.positive("IMPORT_TIMEOUT_LIVE_SECS", 30));
        let rpc_fetch_retries = r.parsed("RPC_FETCH_RETRIES", 5_u32);
        let error_base_penalty = Duration::from_millis(r.parsed("ERROR_BASE_PENALTY_MS", 500_u64));
        let error_max_penalty =
            Duration::from_millis(r.parsed("ERROR_MAX_PENALTY_MS", 120_000_u64));
        if error_max_penalty < error_base_penalty {
            r.errors.push(format!(
                "ERROR_MAX_PENALTY_MS ({}) must not be lower than ERROR_BASE_PENALTY_MS ({})",
                error_max_penalty.as_millis(),
                error_base_penalty.as_millis()
            ));
        }
        let stats_report_interval =
            Duration::from_secs(r.positive("STATS_REPORT_INTERVAL_SECS", 60));
        let health_max_request_repeats = r.parsed("HEALTH_MAX_REQUEST_REPEATS", 5_u32);
        let health_stale_after = Duration::from_secs(r.positive("HEALTH_STALE_AFTER_SECS", 120));
        let http_port = r.optional::<u16>("HTTP_PORT");

        if !r.errors.is_empty() {
            return Err(IndexerError::config(r.errors));
        }

        Ok(Self {
            connection_string,
            rpc_url,
            hub_address,
            start_from_block,
            bulk_threshold,
            live_poll_interval,
            reorg_check_interval,
            reorg_check_depth,
            limits,
            flush_every_nth_batch_bulk,
            flush_every_nth_batch_live,
            import_timeout_bulk,
            import_timeout_live,
            rpc_fetch_retries,
            error_base_penalty,
            error_max_penalty,
            stats_report_interval,
            health_max_request_repeats,
            health_stale_after,
            http_port,
        })
    }

    /// Database URL.
    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Node JSON-RPC URL.
    #[must_use]
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Circles hub contract address.
    #[must_use]
    pub const fn hub_address(&self) -> Address {
        self.hub_address
    }

    /// First height indexed when the store is empty.
    #[must_use]
    pub const fn start_from_block(&self) -> u64 {
        self.start_from_block
    }

    /// Lag (in blocks) above which a round runs in catch-up mode.
    #[must_use]
    pub const fn bulk_threshold(&self) -> u64 {
        self.bulk_threshold
    }

    /// Chain head polling interval in live mode.
    #[must_use]
    pub const fn live_poll_interval(&self) -> Duration {
        self.live_poll_interval
    }

    /// Interval between reorg checks.
    #[must_use]
    pub const fn reorg_check_interval(&self) -> Duration {
        self.reorg_check_interval
    }

    /// Number of most recent stored blocks re-verified by each reorg check.
    #[must_use]
    pub const fn reorg_check_depth(&self) -> u64 {
        self.reorg_check_depth
    }

    /// Pipeline concurrency and buffer limits.
    #[must_use]
    pub const fn limits(&self) -> PipelineLimits {
        self.limits
    }

    /// Batches between promotions in catch-up mode.
    #[must_use]
    pub const fn flush_every_nth_batch_bulk(&self) -> u64 {
        self.flush_every_nth_batch_bulk
    }

    /// Batches between promotions in live mode.
    #[must_use]
    pub const fn flush_every_nth_batch_live(&self) -> u64 {
        self.flush_every_nth_batch_live
    }

    /// Promotion timeout in catch-up mode.
    #[must_use]
    pub const fn import_timeout_bulk(&self) -> Duration {
        self.import_timeout_bulk
    }

    /// Promotion timeout in live mode.
    #[must_use]
    pub const fn import_timeout_live(&self) -> Duration {
        self.import_timeout_live
    }

    /// Retries per block/receipt fetch before giving up.
    #[must_use]
    pub const fn rpc_fetch_retries(&self) -> u32 {
        self.rpc_fetch_retries
    }

    /// Base of the quadratic round penalty.
    #[must_use]
    pub const fn error_base_penalty(&self) -> Duration {
        self.error_base_penalty
    }

    /// Upper bound of the round penalty.
    #[must_use]
    pub const fn error_max_penalty(&self) -> Duration {
        self.error_max_penalty
    }

    /// Interval between statistics log lines.
    #[must_use]
    pub const fn stats_report_interval(&self) -> Duration {
        self.stats_report_interval
    }

    /// Requests of the same height tolerated before health reports looping.
    #[must_use]
    pub const fn health_max_request_repeats(&self) -> u32 {
        self.health_max_request_repeats
    }

    /// Age of the last completed batch after which health reports stale.
    #[must_use]
    pub const fn health_stale_after(&self) -> Duration {
        self.health_stale_after
    }

    /// Port of the health/stream HTTP server, if enabled.
    #[must_use]
    pub const fn http_port(&self) -> Option<u16> {
        self.http_port
    }

    /// Override the pipeline limits (tests and tuning tools).
    #[must_use]
    pub const fn with_limits(mut self, limits: PipelineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Override the live polling interval.
    #[must_use]
    pub const fn with_live_poll_interval(mut self, interval: Duration) -> Self {
        self.live_poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_lookup(lookup(&[
            ("CONNECTION_STRING", "sqlite::memory:"),
            ("RPC_URL", "http://localhost:8545"),
        ]))
        .expect("valid config");

        assert_eq!(config.bulk_threshold(), 24);
        assert_eq!(config.reorg_check_depth(), 18);
        assert_eq!(config.reorg_check_interval(), Duration::from_secs(60));
        assert_eq!(config.hub_address(), DEFAULT_HUB_ADDRESS);
        assert_eq!(config.limits(), PipelineLimits::default());
        assert!(config.http_port().is_none());
    }

    #[test]
    fn test_missing_required_values_are_aggregated() {
        let err = Config::from_lookup(lookup(&[])).expect_err("must fail");
        match err {
            IndexerError::ConfigError { errors, .. } => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().any(|e| e.contains("CONNECTION_STRING")));
                assert!(errors.iter().any(|e| e.contains("RPC_URL")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_every_invalid_value_is_reported() {
        let err = Config::from_lookup(lookup(&[
            ("CONNECTION_STRING", "postgres://nope"),
            ("RPC_URL", "localhost"),
            ("HUB_ADDRESS", "not-an-address"),
            ("BULK_THRESHOLD", "many"),
            ("MAX_PARALLEL_BLOCK_DOWNLOADS", "0"),
            ("HTTP_PORT", "99999"),
        ]))
        .expect_err("must fail");

        match err {
            IndexerError::ConfigError { errors, .. } => assert_eq!(errors.len(), 6),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_penalty_bounds_validated() {
        let err = Config::from_lookup(lookup(&[
            ("CONNECTION_STRING", "sqlite::memory:"),
            ("RPC_URL", "http://localhost:8545"),
            ("ERROR_BASE_PENALTY_MS", "5000"),
            ("ERROR_MAX_PENALTY_MS", "100"),
        ]));
        assert!(err.is_err());
    }
}
