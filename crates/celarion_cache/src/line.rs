//! Registers and cache lines.

use celarion_core::{Locator, LogicalTime, Value};
use serde::{Deserialize, Serialize};

/// A cache line owned by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLine {
    /// Address of the line
    pub locator: Locator,
    /// Last written value
    pub value: Value,
    /// False once flushed
    pub valid: bool,
    /// Store time of the last write or validating prefetch
    pub validated_at: LogicalTime,
}

impl CacheLine {
    pub(crate) fn new(locator: Locator, value: Value, now: LogicalTime) -> Self {
        Self {
            locator,
            value,
            valid: true,
            validated_at: now,
        }
    }
}

/// Contents of a register
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterValue {
    /// Never written
    #[default]
    Empty,
    /// Range-checked scalar
    Scalar(Value),
    /// Reference to a cache line
    Line(Locator),
}

/// A named register slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    /// Register name
    pub name: String,
    /// Current contents
    pub value: RegisterValue,
}

impl Register {
    /// Create an empty register
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: RegisterValue::Empty,
        }
    }
}
