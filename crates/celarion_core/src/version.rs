//! Rule set version counter.

use serde::{Deserialize, Serialize};

/// Monotonic rule set version; every committed edit advances it by one
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RuleVersion(pub u64);

impl RuleVersion {
    /// Version of an empty rule set
    pub const INITIAL: Self = Self(0);

    /// The version a commit on top of this one produces
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for RuleVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
