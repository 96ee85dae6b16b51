//! Store configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of cache lines, tombstones included
    pub line_capacity: usize,
    /// Maximum number of registers
    pub register_capacity: usize,
    /// Deadline for one backing-source load on a prefetch miss, in milliseconds
    pub load_deadline_ms: u64,
}

impl StoreConfig {
    /// Create with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set line capacity
    #[must_use]
    pub fn with_line_capacity(mut self, capacity: usize) -> Self {
        self.line_capacity = capacity;
        self
    }

    /// Set register capacity
    #[must_use]
    pub fn with_register_capacity(mut self, capacity: usize) -> Self {
        self.register_capacity = capacity;
        self
    }

    /// Set load deadline
    #[must_use]
    pub fn with_load_deadline(mut self, deadline: Duration) -> Self {
        self.load_deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Load deadline as a duration
    #[must_use]
    pub fn load_deadline(&self) -> Duration {
        Duration::from_millis(self.load_deadline_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            line_capacity: 256,
            register_capacity: 64,
            load_deadline_ms: 250,
        }
    }
}
