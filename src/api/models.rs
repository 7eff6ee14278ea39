//! API response models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indexer::StatsSnapshot;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall health status
    pub status: HealthStatus,
    /// Application version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Database status
    pub database_status: HealthStatus,
    /// Failed checks, empty when healthy
    pub reasons: Vec<String>,
    /// Indexer counters
    pub stats: StatsSnapshot,
}

/// Health status states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All checks passed
    Healthy,
    /// At least one check failed
    Unhealthy,
}

/// WebSocket message of the transaction stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// `connected`, `new_transaction` or `lagged`
    pub event_type: String,
    /// Transaction hash for `new_transaction`
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash: Option<String>,
    /// Hashes skipped because the client was too slow, for `lagged`
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub skipped: Option<u64>,
    /// Server time
    pub timestamp: DateTime<Utc>,
}

impl StreamMessage {
    /// Greeting sent right after the upgrade.
    #[must_use]
    pub fn connected() -> Self {
        Self {
            event_type: "connected".to_string(),
            hash: None,
            skipped: None,
            timestamp: Utc::now(),
        }
    }

    /// A transaction became permanent.
    #[must_use]
    pub fn new_transaction(hash: String) -> Self {
        Self {
            event_type: "new_transaction".to_string(),
            hash: Some(hash),
            skipped: None,
            timestamp: Utc::now(),
        }
    }

    /// The client fell behind and `skipped` hashes were dropped.
    #[must_use]
    pub fn lagged(skipped: u64) -> Self {
        Self {
            event_type: "lagged".to_string(),
            hash: None,
            skipped: Some(skipped),
            timestamp: Utc::now(),
        }
    }
}
