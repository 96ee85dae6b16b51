//! Guild errors.

use celarion_core::{CoreError, EditId, ExitCode, GuildName, MemberId};
use celarion_rules::{LogError, RuleError};
use celarion_runtime::ExecError;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Peer is not reachable
    #[error("Peer unreachable: {0}")]
    Unreachable(MemberId),

    /// Round trip exceeded its deadline
    #[error("Round trip timeout after {0}ms")]
    Timeout(u64),

    /// Frame could not be encoded or decoded
    #[error("Wire encoding error: {0}")]
    Encoding(String),

    /// Local endpoint was shut down
    #[error("Transport closed")]
    Closed,
}

/// GuildSync errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuildError {
    /// Two members resolved the same round differently
    #[error("Conflict unresolved for {edit_id}: {reason}")]
    ConflictUnresolved {
        /// Edit named by the disagreeing commit
        edit_id: EditId,
        /// What disagreed
        reason: String,
    },

    /// A peer exhausted its retry budget
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(MemberId),

    /// A version was committed twice; the member must stop
    #[error("Store corruption: {0}")]
    StoreCorruption(String),

    /// Guild not attached on this member
    #[error("Unknown guild: {0}")]
    UnknownGuild(GuildName),

    /// Sender is not on the guild roster
    #[error("{member} is not a member of {guild}")]
    NotMember {
        /// Sender
        member: MemberId,
        /// Guild
        guild: GuildName,
    },

    /// Edit failed rule set validation
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Rule branch could not be started
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Edit could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Local configuration is unusable
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GuildError {
    /// True if the member can no longer be trusted to keep running
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreCorruption(_))
    }

    /// Exit code for the control surface
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::ConflictUnresolved { .. } => ExitCode::ConflictUnresolved,
            Self::PeerUnreachable(_) => ExitCode::PeerUnreachable,
            Self::Exec(err) => err.exit_code(),
            _ => ExitCode::Failure,
        }
    }
}

impl From<LogError> for GuildError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::DoubleCommit { .. } | LogError::BrokenChain { .. } => {
                Self::StoreCorruption(err.to_string())
            }
            LogError::Replay { source, .. } => Self::Rule(source),
            other => Self::StoreCorruption(other.to_string()),
        }
    }
}

impl From<GuildError> for CoreError {
    fn from(err: GuildError) -> Self {
        match err {
            GuildError::UnknownGuild(guild) => CoreError::NotFound {
                kind: "guild".to_string(),
                id: guild.to_string(),
            },
            other => CoreError::Internal {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celarion_core::RuleVersion;

    #[test]
    fn test_exit_codes() {
        let conflict = GuildError::ConflictUnresolved {
            edit_id: EditId::new(),
            reason: "winner differs".into(),
        };
        assert_eq!(conflict.exit_code().code(), 2);

        let unreachable = GuildError::PeerUnreachable(MemberId::new("b").unwrap());
        assert_eq!(unreachable.exit_code().code(), 4);

        let config = GuildError::Config("no guilds".into());
        assert_eq!(config.exit_code().code(), 1);

        let breach: GuildError = ExecError::SealBreach {
            key: "quota".into(),
        }
        .into();
        assert_eq!(breach.exit_code(), ExitCode::SealBreach);
    }

    #[test]
    fn test_double_commit_is_store_corruption() {
        let err: GuildError = LogError::DoubleCommit {
            version: RuleVersion(4),
        }
        .into();
        assert!(err.is_fatal());
        assert!(matches!(err, GuildError::StoreCorruption(_)));
    }
}
