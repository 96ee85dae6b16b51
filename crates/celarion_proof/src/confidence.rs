//! Confidence scores attached to guild proposals.
//!
//! Scores are fixed-point thousandths so comparison is total and the
//! encoding is byte-stable across platforms.

use crate::engine::{ProofTrace, StepOutcome};
use serde::{Deserialize, Serialize};

/// Confidence in `0..=1000` thousandths
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Confidence(u16);

impl Confidence {
    /// Scale of one whole unit
    pub const SCALE: u16 = 1000;
    /// Lowest confidence
    pub const ZERO: Self = Self(0);
    /// Highest confidence
    pub const FULL: Self = Self(Self::SCALE);

    /// Create from thousandths, clamped to `1000`
    #[must_use]
    pub const fn from_thousandths(value: u16) -> Self {
        if value > Self::SCALE {
            Self(Self::SCALE)
        } else {
            Self(value)
        }
    }

    /// Create from a `numerator / denominator` ratio, rounding down
    #[must_use]
    pub fn from_ratio(numerator: u64, denominator: u64) -> Self {
        if denominator == 0 {
            return Self::ZERO;
        }
        let scaled = numerator.saturating_mul(u64::from(Self::SCALE)) / denominator;
        Self::from_thousandths(u16::try_from(scaled).unwrap_or(Self::SCALE))
    }

    /// Get thousandths
    #[must_use]
    pub const fn thousandths(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:03}", self.0 / Self::SCALE, self.0 % Self::SCALE)
    }
}

/// Turns an evaluation trace into a confidence score
pub trait ConfidenceScorer: Send + Sync {
    /// Score a trace
    fn score(&self, trace: &ProofTrace) -> Confidence;
}

/// Mean of per-step weights: validated 1000, passed 500, failed or skipped 0.
/// A zero-step chain scores 500.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepRatioScorer;

impl StepRatioScorer {
    const VALIDATED: u64 = 1000;
    const PASSED: u64 = 500;
}

impl ConfidenceScorer for StepRatioScorer {
    fn score(&self, trace: &ProofTrace) -> Confidence {
        if trace.steps.is_empty() {
            return Confidence::from_thousandths(Self::PASSED as u16);
        }
        let total: u64 = trace
            .steps
            .iter()
            .map(|s| match s {
                StepOutcome::Validated => Self::VALIDATED,
                StepOutcome::Passed => Self::PASSED,
                StepOutcome::Failed(_) | StepOutcome::Skipped => 0,
            })
            .sum();
        Confidence::from_ratio(total, trace.steps.len() as u64 * u64::from(Confidence::SCALE))
    }
}
