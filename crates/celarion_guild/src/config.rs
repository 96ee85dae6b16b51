//! Guild configuration.

use crate::error::GuildError;
use crate::membership::{Guild, RosterEntry};
use celarion_core::{GuildName, MemberId, NodeId};
use celarion_runtime::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Round settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Logical ticks a round stays open after its first proposal
    pub settle_window: u64,
    /// Committed versions for which final edit states and rebase notices
    /// stay queryable
    pub history: u64,
}

impl SyncConfig {
    /// Create with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the settle window
    #[must_use]
    pub fn with_settle_window(mut self, ticks: u64) -> Self {
        self.settle_window = ticks;
        self
    }

    /// Set how many versions of edit outcomes are retained
    #[must_use]
    pub fn with_history(mut self, versions: u64) -> Self {
        self.history = versions;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_window: 2,
            history: 64,
        }
    }
}

/// Retry settings for peer round trips
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// First backoff in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff growth per attempt
    pub multiplier: u32,
    /// Attempts before the peer is marked stale
    pub max_attempts: u32,
    /// Deadline for one round trip in milliseconds
    pub round_trip_deadline_ms: u64,
}

impl RetryPolicy {
    /// Create with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the first backoff
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the attempt budget
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the round-trip deadline
    #[must_use]
    pub fn with_round_trip_deadline(mut self, deadline: Duration) -> Self {
        self.round_trip_deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Backoff before retry number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }

    /// Round-trip deadline as a duration
    #[must_use]
    pub fn round_trip_deadline(&self) -> Duration {
        Duration::from_millis(self.round_trip_deadline_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 50,
            multiplier: 2,
            max_attempts: 4,
            round_trip_deadline_ms: 500,
        }
    }
}

/// One attached guild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildConfig {
    /// Guild name
    pub name: GuildName,
    /// Roster with priorities
    pub roster: Vec<RosterEntry>,
}

impl From<GuildConfig> for Guild {
    fn from(config: GuildConfig) -> Self {
        Self {
            name: config.name,
            roster: config.roster,
        }
    }
}

/// Everything needed to start a guild member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This member
    pub member: MemberId,
    /// Attached guilds
    #[serde(default)]
    pub guilds: Vec<GuildConfig>,
    /// Run rule branches concurrently
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Graph entry nodes for ad-hoc runs
    #[serde(default)]
    pub entry: Vec<NodeId>,
    /// Round settings
    #[serde(default)]
    pub sync: SyncConfig,
    /// Peer retry settings
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_parallel() -> bool {
    true
}

impl NodeConfig {
    /// Create a config for `member` with no guilds
    #[must_use]
    pub fn new(member: MemberId) -> Self {
        Self {
            member,
            guilds: Vec::new(),
            parallel: true,
            entry: Vec::new(),
            sync: SyncConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Attach a guild
    #[must_use]
    pub fn with_guild(mut self, guild: Guild) -> Self {
        self.guilds.push(GuildConfig {
            name: guild.name,
            roster: guild.roster,
        });
        self
    }

    /// Enable or disable parallel rule branches
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the entry route
    #[must_use]
    pub fn with_entry(mut self, entry: Vec<NodeId>) -> Self {
        self.entry = entry;
        self
    }

    /// Set round settings
    #[must_use]
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Set retry settings
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Scheduler settings implied by this config
    #[must_use]
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::new().with_parallel(self.parallel)
    }

    /// Parse from JSON and validate
    ///
    /// # Errors
    ///
    /// Returns `Config` if the JSON is malformed or a roster is unusable
    pub fn from_json(json: &str) -> Result<Self, GuildError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| GuildError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every attached guild names this member exactly once
    ///
    /// # Errors
    ///
    /// Returns the first roster problem found
    pub fn validate(&self) -> Result<(), GuildError> {
        let mut names = indexmap::IndexSet::new();
        for guild in &self.guilds {
            if !names.insert(&guild.name) {
                return Err(GuildError::Config(format!("guild {} attached twice", guild.name)));
            }
            Guild::from(guild.clone()).validate_for(&self.member)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows() {
        let policy = RetryPolicy::new().with_initial_backoff(Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(4), Duration::from_millis(80));
    }

    #[test]
    fn test_node_config_from_json() {
        let json = r#"{
            "member": "a",
            "guilds": [
                {"name": "ops", "roster": [{"member": "a", "priority": 1}, {"member": "b"}]}
            ],
            "parallel": false,
            "entry": [0, 3]
        }"#;
        let config = NodeConfig::from_json(json).unwrap();
        assert_eq!(config.member.as_str(), "a");
        assert!(!config.parallel);
        assert_eq!(config.entry, vec![NodeId(0), NodeId(3)]);
        assert_eq!(config.guilds[0].roster[1].priority, 0);
        assert_eq!(config.sync, SyncConfig::default());
        assert!(!config.scheduler().parallel);
    }

    #[test]
    fn test_node_config_rejects_foreign_roster() {
        let json = r#"{"member": "a", "guilds": [{"name": "ops", "roster": [{"member": "b"}]}]}"#;
        assert!(matches!(
            NodeConfig::from_json(json),
            Err(GuildError::NotMember { .. })
        ));
    }
}
