//! Opaque range-checked values.
//!
//! Literal encoding is out of scope here; a value is an integer, a flag, or
//! an integer carrying the range it must stay within.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Inclusive integer range `[min::max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueRange {
    /// Lower bound, inclusive
    pub min: i64,
    /// Upper bound, inclusive
    pub max: i64,
}

impl ValueRange {
    /// Create a range
    ///
    /// # Errors
    ///
    /// Returns error if `min > max`
    pub fn new(min: i64, max: i64) -> CoreResult<Self> {
        if min > max {
            return Err(CoreError::Validation {
                field: "range".to_string(),
                reason: format!("min {} exceeds max {}", min, max),
            });
        }
        Ok(Self { min, max })
    }

    /// Check membership
    #[must_use]
    pub const fn contains(&self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Check membership, producing a range violation on failure
    ///
    /// # Errors
    ///
    /// Returns `RangeViolation` if `value` is outside the range
    pub fn check(&self, value: i64) -> CoreResult<i64> {
        if self.contains(value) {
            Ok(value)
        } else {
            Err(CoreError::RangeViolation {
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

impl std::fmt::Display for ValueRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}::{}]", self.min, self.max)
    }
}

/// Integer bound to a range it may never leave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangedValue {
    value: i64,
    range: ValueRange,
}

impl RangedValue {
    /// Create a ranged value
    ///
    /// # Errors
    ///
    /// Returns `RangeViolation` if `value` is outside `range`
    pub fn new(value: i64, range: ValueRange) -> CoreResult<Self> {
        range.check(value)?;
        Ok(Self { value, range })
    }

    /// Get the value
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.value
    }

    /// Get the range
    #[must_use]
    pub const fn range(&self) -> ValueRange {
        self.range
    }

    /// Replace the value, keeping the range
    ///
    /// # Errors
    ///
    /// Returns `RangeViolation` if `value` is outside the range
    pub fn with_value(&self, value: i64) -> CoreResult<Self> {
        Self::new(value, self.range)
    }
}

/// A runtime value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Plain integer
    Int(i64),
    /// Boolean flag
    Bool(bool),
    /// Range-checked integer
    Ranged(RangedValue),
}

impl Value {
    /// Integer view, `None` for flags
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Ranged(r) => Some(r.get()),
            Self::Bool(_) => None,
        }
    }

    /// Truthiness: non-zero integers and `true`
    #[must_use]
    pub const fn truthy(&self) -> bool {
        match self {
            Self::Int(v) => *v != 0,
            Self::Ranged(r) => r.get() != 0,
            Self::Bool(b) => *b,
        }
    }

    /// Add `delta`, keeping a ranged value inside its range
    ///
    /// # Errors
    ///
    /// Returns error on a flag, on overflow, or on leaving the range
    pub fn checked_add(&self, delta: i64) -> CoreResult<Self> {
        let overflow = || CoreError::Validation {
            field: "value".to_string(),
            reason: "integer overflow".to_string(),
        };
        match self {
            Self::Int(v) => v.checked_add(delta).map(Self::Int).ok_or_else(overflow),
            Self::Ranged(r) => {
                let next = r.get().checked_add(delta).ok_or_else(overflow)?;
                Ok(Self::Ranged(r.with_value(next)?))
            }
            Self::Bool(_) => Err(CoreError::Validation {
                field: "value".to_string(),
                reason: "cannot add to a flag".to_string(),
            }),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Ranged(r) => write!(f, "{}{}", r.get(), r.range()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_check() {
        let range = ValueRange::new(5, 25).unwrap();
        assert!(range.contains(5));
        assert!(range.contains(25));
        assert!(!range.contains(26));
        assert_eq!(
            range.check(30),
            Err(CoreError::RangeViolation {
                value: 30,
                min: 5,
                max: 25
            })
        );
        assert!(ValueRange::new(3, 1).is_err());
    }

    #[test]
    fn test_ranged_value_stays_in_range() {
        let range = ValueRange::new(0, 10).unwrap();
        let v = Value::Ranged(RangedValue::new(9, range).unwrap());
        assert_eq!(v.checked_add(1).unwrap().as_int(), Some(10));
        assert!(matches!(
            v.checked_add(2),
            Err(CoreError::RangeViolation { .. })
        ));
        assert!(RangedValue::new(11, range).is_err());
    }

    #[test]
    fn test_truthy() {
        assert!(Value::Int(3).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Bool(true).truthy());
        assert_eq!(Value::Bool(true).as_int(), None);
        assert!(Value::Bool(false).checked_add(1).is_err());
    }

    #[test]
    fn test_value_json_shape() {
        let json = serde_json::to_string(&Value::Int(4)).unwrap();
        assert_eq!(json, r#"{"int":4}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Int(4));
    }
}
