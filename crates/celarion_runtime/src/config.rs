//! Engine and scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stack engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Visits allowed per node in one top-level invocation
    pub max_iterations: u32,
    /// Deadline for one locator prefetch, in milliseconds
    pub locator_deadline_ms: u64,
    /// Pause before retrying an unresolved locator, in milliseconds
    pub settle_delay_ms: u64,
    /// Retries after the first failed resolution
    pub locator_retries: u32,
}

impl EngineConfig {
    /// Create with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-node visit ceiling
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the locator deadline
    #[must_use]
    pub fn with_locator_deadline(mut self, deadline: Duration) -> Self {
        self.locator_deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the settle delay
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the retry count
    #[must_use]
    pub fn with_locator_retries(mut self, retries: u32) -> Self {
        self.locator_retries = retries;
        self
    }

    /// Locator deadline as a duration
    #[must_use]
    pub fn locator_deadline(&self) -> Duration {
        Duration::from_millis(self.locator_deadline_ms)
    }

    /// Settle delay as a duration
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1_000,
            locator_deadline_ms: 500,
            settle_delay_ms: 25,
            locator_retries: 2,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run branches concurrently; when false they run one at a time
    pub parallel: bool,
    /// Engine settings shared by every branch
    pub engine: EngineConfig,
}

impl SchedulerConfig {
    /// Create with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable parallel branch workers
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set engine settings
    #[must_use]
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            engine: EngineConfig::default(),
        }
    }
}
