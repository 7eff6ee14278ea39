//! Shared application state for the HTTP adapters.

use std::sync::Arc;
use std::time::SystemTime;

use crate::db::Repository;
use crate::health::HealthMonitor;

/// State handed to every API handler.
#[derive(Clone)]
pub struct AppState {
    /// Repository for the database connectivity check.
    pub repository: Repository,
    /// Health evaluation and the new-transaction broadcast.
    pub monitor: Arc<HealthMonitor>,
    /// Application start time for uptime tracking.
    pub start_time: SystemTime,
}

impl AppState {
    /// Create a new `AppState`.
    #[must_use]
    pub fn new(repository: Repository, monitor: Arc<HealthMonitor>) -> Self {
        Self {
            repository,
            monitor,
            start_time: SystemTime::now(),
        }
    }
}
