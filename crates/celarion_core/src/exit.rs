//! Process exit codes for the control surface.

use serde::{Deserialize, Serialize};

/// Exit code reported by a guild member process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    /// Completed normally
    Success,
    /// Any failure without a dedicated code
    Failure,
    /// Two members resolved the same round differently
    ConflictUnresolved,
    /// A poisoned seal blocked progress
    SealBreach,
    /// A peer exhausted its retry budget
    PeerUnreachable,
}

impl ExitCode {
    /// Numeric process exit code
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::ConflictUnresolved => 2,
            Self::SealBreach => 3,
            Self::PeerUnreachable => 4,
        }
    }

    /// The more severe of two codes; any dedicated code beats `Failure`
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        const fn rank(code: ExitCode) -> u8 {
            match code {
                ExitCode::Success => 0,
                ExitCode::Failure => 1,
                ExitCode::PeerUnreachable => 2,
                ExitCode::SealBreach => 3,
                ExitCode::ConflictUnresolved => 4,
            }
        }
        if rank(other) > rank(self) { other } else { self }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}
