//! Dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options recognised by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of evaluations in flight at once.
    pub max_concurrent_workers: usize,
    /// Wall-clock limit for one external program run (milliseconds).
    pub per_point_timeout_ms: Option<u64>,
    /// Wall-clock limit for the whole sample (milliseconds).
    pub batch_timeout_ms: Option<u64>,
    /// Keep workspaces after their results are harvested.
    pub retain_workspaces: bool,
    /// Abort the batch on the first failing point.
    pub fail_fast: bool,
    /// Reject jobs whose sample is empty.
    pub require_non_empty: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 1,
            per_point_timeout_ms: None,
            batch_timeout_ms: None,
            retain_workspaces: false,
            fail_fast: false,
            require_non_empty: true,
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, thiserror::Error)]
#[error("invalid dispatch configuration: {0}")]
pub struct ConfigError(pub String);

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_workers == 0 {
            return Err(ConfigError(
                "max_concurrent_workers must be at least 1".to_string(),
            ));
        }
        if self.per_point_timeout_ms == Some(0) {
            return Err(ConfigError("per_point_timeout_ms must be positive".to_string()));
        }
        if self.batch_timeout_ms == Some(0) {
            return Err(ConfigError("batch_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn per_point_timeout(&self) -> Option<Duration> {
        self.per_point_timeout_ms.map(Duration::from_millis)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.max_concurrent_workers = workers;
        self
    }

    pub fn with_point_timeout(mut self, timeout: Duration) -> Self {
        self.per_point_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn fail_fast(mut self, on: bool) -> Self {
        self.fail_fast = on;
        self
    }

    pub fn retain_workspaces(mut self, on: bool) -> Self {
        self.retain_workspaces = on;
        self
    }
}
