//! Error types for the Circles chain indexer.
//!
//! This module provides a unified error type [`IndexerError`] covering every
//! failure the pipeline can observe, from configuration loading to the
//! staging/import protocol.
//!
//! # Design
//!
//! The error hierarchy is organized by layer:
//! - [`IndexerError::ConfigError`]: Configuration and environment issues (fatal at startup)
//! - [`IndexerError::RpcError`]: Node RPC and network errors (transient)
//! - [`IndexerError::DecodingError`]: Malformed log or call data
//! - [`IndexerError::ExtractionError`]: Extractor invoked on a non-matching transaction
//! - [`IndexerError::DatabaseError`]: Staging, import and query failures (transient)
//! - [`IndexerError::Timeout`]: An operation exceeded its deadline (transient)
//! - [`IndexerError::StageFailed`]: A pipeline task panicked
//! - [`IndexerError::ReorgDetected`]: Forced round abort at a reorged height
//!
//! The round controller uses [`IndexerError::is_retryable`] to decide whether a
//! failed round is retried after the error penalty or whether the process stops.
//!
//! # Example
//!
//! ```
//! use circles_indexer::error::{IndexerError, IndexerResult};
//!
//! fn validate_limit(limit: u64) -> IndexerResult<()> {
//!     if limit > 100 {
//!         return Err(IndexerError::decoding("trust limit out of range", None));
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;

/// Result type alias using [`IndexerError`].
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Boxed source error carried by most variants.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for the indexer.
#[derive(Debug)]
pub enum IndexerError {
    /// Configuration or environment variable errors.
    ///
    /// `errors` holds every validation failure found, not only the first.
    ConfigError {
        /// Human-readable summary
        message: String,
        /// All individual validation failures
        errors: Vec<String>,
    },

    /// RPC provider or network errors.
    ///
    /// Variants include:
    /// - Failed to connect to the node
    /// - Request timeout or connection reset
    /// - Block or receipt not (yet) available
    RpcError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Log or calldata decoding errors.
    ///
    /// Raised by classification predicates on malformed data. Never fatal:
    /// the classifier drops the affected bit and keeps going.
    DecodingError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// A detail extractor was called on a transaction that does not satisfy
    /// its class predicate.
    ExtractionError {
        /// Human-readable error message
        message: String,
    },

    /// Database operation errors.
    ///
    /// Variants include:
    /// - Connection failures
    /// - Constraint violations
    /// - Import procedure failures
    DatabaseError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// An operation did not complete within its deadline.
    Timeout {
        /// What timed out
        operation: String,
        /// The deadline in milliseconds
        after_ms: u64,
    },

    /// A pipeline stage task ended abnormally (panic or abort).
    StageFailed {
        /// Human-readable error message
        message: String,
    },

    /// The pipeline reached `height`, which the reorg checker flagged. The
    /// round controller purges from there once every stage has stopped.
    ReorgDetected {
        /// Lowest height whose stored hash no longer matches the chain
        height: u64,
    },

}

impl IndexerError {
    /// Create a configuration error from a list of validation failures.
    ///
    /// # Example
    ///
    /// ```
    /// use circles_indexer::error::IndexerError;
    ///
    /// let err = IndexerError::config(vec!["RPC_URL is required".to_string()]);
    /// assert!(matches!(err, IndexerError::ConfigError { .. }));
    /// ```
    #[must_use]
    pub fn config(errors: Vec<String>) -> Self {
        let message = format!("{} invalid setting(s): {}", errors.len(), errors.join("; "));
        Self::ConfigError { message, errors }
    }

    /// Create a new RPC error.
    ///
    /// # Example
    ///
    /// ```
    /// use circles_indexer::error::IndexerError;
    ///
    /// let err = IndexerError::rpc("Failed to connect to provider", None);
    /// assert!(matches!(err, IndexerError::RpcError { .. }));
    /// ```
    #[must_use]
    pub fn rpc(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::RpcError {
            message: message.into(),
            source,
        }
    }

    /// Create a new decoding error.
    #[must_use]
    pub fn decoding(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::DecodingError {
            message: message.into(),
            source,
        }
    }

    /// Create a new extraction error.
    #[must_use]
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::ExtractionError {
            message: message.into(),
        }
    }

    /// Create a new database error.
    ///
    /// # Example
    ///
    /// ```
    /// use circles_indexer::error::IndexerError;
    ///
    /// let err = IndexerError::database("Connection failed", None);
    /// assert!(matches!(err, IndexerError::DatabaseError { .. }));
    /// ```
    #[must_use]
    pub fn database(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::DatabaseError {
            message: message.into(),
            source,
        }
    }

    /// Create a stage failure error.
    #[must_use]
    pub fn stage_failed(message: impl Into<String>) -> Self {
        Self::StageFailed {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Whether the round controller should retry after this error.
    ///
    /// Configuration errors are the only fatal class; everything else restarts
    /// the round after the error penalty.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::ConfigError { .. })
    }

    /// Whether this error is the forced abort that follows a reorg purge.
    #[must_use]
    pub const fn is_reorg(&self) -> bool {
        matches!(self, Self::ReorgDetected { .. })
    }
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError { message, .. } => write!(f, "Configuration error: {message}"),
            Self::RpcError { message, .. } => write!(f, "RPC error: {message}"),
            Self::DecodingError { message, .. } => write!(f, "Decoding error: {message}"),
            Self::ExtractionError { message } => write!(f, "Extraction error: {message}"),
            Self::DatabaseError { message, .. } => write!(f, "Database error: {message}"),
            Self::Timeout {
                operation,
                after_ms,
            } => write!(f, "Timeout: {operation} did not complete within {after_ms}ms"),
            Self::StageFailed { message } => write!(f, "Pipeline stage failed: {message}"),
            Self::ReorgDetected { height } => {
                write!(f, "Reorg detected at block {height}")
            }
        }
    }
}

impl std::error::Error for IndexerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RpcError { source, .. }
            | Self::DecodingError { source, .. }
            | Self::DatabaseError { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &dyn std::error::Error),
            Self::ConfigError { .. }
            | Self::ExtractionError { .. }
            | Self::Timeout { .. }
            | Self::StageFailed { .. }
            | Self::ReorgDetected { .. } => None,
        }
    }
}

impl From<sqlx::Error> for IndexerError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string(), Some(Box::new(err)))
    }
}

/// Convert from `eyre::Report` to `IndexerError`.
///
/// eyre reports only surface from RPC helpers, so they are categorized as
/// RPC errors.
impl From<eyre::Report> for IndexerError {
    fn from(err: eyre::Report) -> Self {
        Self::RpcError {
            message: err.to_string(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_lists_all_failures() {
        let err = IndexerError::config(vec![
            "RPC_URL is required".to_string(),
            "BULK_THRESHOLD must be a number".to_string(),
        ]);
        assert!(matches!(err, IndexerError::ConfigError { ref errors, .. } if errors.len() == 2));
        let text = err.to_string();
        assert!(text.contains("RPC_URL is required"));
        assert!(text.contains("BULK_THRESHOLD"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rpc_error() {
        let err = IndexerError::rpc("connection failed", None);
        assert_eq!(err.to_string(), "RPC error: connection failed");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_reorg_error() {
        let err = IndexerError::ReorgDetected { height: 110 };
        assert!(err.is_reorg());
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Reorg detected at block 110");
    }

    #[test]
    fn test_timeout_error() {
        let err = IndexerError::timeout("import", std::time::Duration::from_secs(2));
        assert_eq!(
            err.to_string(),
            "Timeout: import did not complete within 2000ms"
        );
    }

    #[test]
    fn test_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "socket closed");
        let err = IndexerError::rpc("failed to fetch", Some(Box::new(source)));

        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "RPC error: failed to fetch");
    }
}
