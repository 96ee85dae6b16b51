//! Execution errors.

use celarion_cache::CacheError;
use celarion_core::{CoreError, ExitCode, Locator, NodeId};
use celarion_graph::GraphError;
use celarion_proof::ProofError;
use celarion_rules::RuleError;

/// Error raised while running a rule branch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    /// No trigger edge guard held and there is no fallback
    #[error("No viable branch out of {node}")]
    NoViableBranch {
        /// Node where selection failed
        node: NodeId,
    },

    /// A node was visited more often than allowed
    #[error("Iteration limit {limit} exceeded at {node}")]
    IterationLimitExceeded {
        /// Node that hit the ceiling
        node: NodeId,
        /// Configured ceiling
        limit: u32,
    },

    /// The seal for a vault key is poisoned
    #[error("Seal breach on vault key {key:?}")]
    SealBreach {
        /// Vault key
        key: String,
    },

    /// The branch was cancelled
    #[error("Branch cancelled")]
    Cancelled,

    /// A locator stayed unresolved after every retry
    #[error("Unresolved locator @{locator}")]
    UnresolvedLocator {
        /// Locator
        locator: Locator,
    },

    /// An action read a binding that is not set
    #[error("Unbound name {0:?}")]
    Unbound(String),

    /// A load read an empty register
    #[error("Register {0:?} is empty")]
    EmptyRegister(String),

    /// A value left its declared range
    #[error("Range violation: {value} not in [{min}::{max}]")]
    RangeViolation {
        /// Offending value
        value: i64,
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },

    /// Other value error
    #[error("Value error: {0}")]
    Value(String),

    /// Proof evaluation failed for a reason other than a missing locator
    #[error("Proof error: {0}")]
    Proof(String),

    /// Store failure
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Graph failure
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Rule set failure
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// The branch panicked
    #[error("Branch panicked: {0}")]
    Panicked(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// True for errors that poison the seals a branch holds
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoViableBranch { .. }
                | Self::IterationLimitExceeded { .. }
                | Self::Unbound(_)
                | Self::EmptyRegister(_)
                | Self::RangeViolation { .. }
                | Self::Value(_)
                | Self::Proof(_)
                | Self::Graph(_)
                | Self::Panicked(_)
        )
    }

    /// Exit code for the control surface
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::SealBreach { .. } => ExitCode::SealBreach,
            _ => ExitCode::Failure,
        }
    }
}

impl From<CoreError> for ExecError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::RangeViolation { value, min, max } => Self::RangeViolation { value, min, max },
            CoreError::Cancelled => Self::Cancelled,
            other => Self::Value(other.to_string()),
        }
    }
}

impl From<ProofError> for ExecError {
    fn from(err: ProofError) -> Self {
        match err {
            ProofError::UnresolvedLocator { locator, .. } => Self::UnresolvedLocator { locator },
            other => Self::Proof(other.to_string()),
        }
    }
}

impl From<ExecError> for CoreError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Cancelled => CoreError::Cancelled,
            ExecError::RangeViolation { value, min, max } => {
                CoreError::RangeViolation { value, min, max }
            }
            other => CoreError::Internal {
                message: other.to_string(),
            },
        }
    }
}
