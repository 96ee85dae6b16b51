//! Guild rosters and member state.

use crate::error::GuildError;
use celarion_core::{GuildName, MemberId, RuleVersion, VectorClock};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// One roster line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Member identity
    pub member: MemberId,
    /// Guild priority; higher wins confidence ties
    #[serde(default)]
    pub priority: u32,
}

impl RosterEntry {
    /// Create an entry
    #[must_use]
    pub fn new(member: MemberId, priority: u32) -> Self {
        Self { member, priority }
    }
}

/// A named set of members with their priorities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guild {
    /// Guild name
    pub name: GuildName,
    /// Members in roster order
    pub roster: Vec<RosterEntry>,
}

impl Guild {
    /// Create an empty guild
    #[must_use]
    pub fn new(name: GuildName) -> Self {
        Self {
            name,
            roster: Vec::new(),
        }
    }

    /// Add a member
    #[must_use]
    pub fn with_member(mut self, member: MemberId, priority: u32) -> Self {
        self.roster.push(RosterEntry::new(member, priority));
        self
    }

    /// True if `member` is on the roster
    #[must_use]
    pub fn contains(&self, member: &MemberId) -> bool {
        self.roster.iter().any(|e| &e.member == member)
    }

    /// Priority of `member`; zero when off the roster
    #[must_use]
    pub fn priority(&self, member: &MemberId) -> u32 {
        self.roster
            .iter()
            .find(|e| &e.member == member)
            .map_or(0, |e| e.priority)
    }

    /// Members in roster order
    pub fn members(&self) -> impl Iterator<Item = &MemberId> {
        self.roster.iter().map(|e| &e.member)
    }

    /// Every member except `member`
    pub fn peers_of<'a>(&'a self, member: &'a MemberId) -> impl Iterator<Item = &'a MemberId> {
        self.members().filter(move |m| *m != member)
    }

    /// Check the roster is usable and names `member`
    ///
    /// # Errors
    ///
    /// Returns `Config` for duplicate entries and `NotMember` if `member`
    /// is absent
    pub fn validate_for(&self, member: &MemberId) -> Result<(), GuildError> {
        let mut seen = IndexSet::new();
        for entry in &self.roster {
            if !seen.insert(&entry.member) {
                return Err(GuildError::Config(format!(
                    "{} listed twice in {}",
                    entry.member, self.name
                )));
            }
        }
        if !self.contains(member) {
            return Err(GuildError::NotMember {
                member: member.clone(),
                guild: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// A member's view of itself across guilds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildMember {
    /// Identity
    pub id: MemberId,
    /// Last committed version per attached guild
    pub versions: IndexMap<GuildName, RuleVersion>,
    /// Local vector clock
    pub clock: VectorClock,
}

impl GuildMember {
    /// Create a member with no guilds
    #[must_use]
    pub fn new(id: MemberId) -> Self {
        Self {
            id,
            versions: IndexMap::new(),
            clock: VectorClock::new(),
        }
    }

    /// Last committed version in `guild`
    #[must_use]
    pub fn version(&self, guild: &GuildName) -> Option<RuleVersion> {
        self.versions.get(guild).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> MemberId {
        MemberId::new(name).unwrap()
    }

    #[test]
    fn test_priority_lookup() {
        let guild = Guild::new(GuildName::new("ops").unwrap())
            .with_member(member("a"), 2)
            .with_member(member("b"), 5);
        assert_eq!(guild.priority(&member("b")), 5);
        assert_eq!(guild.priority(&member("zed")), 0);
        assert_eq!(guild.peers_of(&member("a")).collect::<Vec<_>>(), vec![&member("b")]);
    }

    #[test]
    fn test_validate_for() {
        let guild = Guild::new(GuildName::new("ops").unwrap())
            .with_member(member("a"), 1)
            .with_member(member("a"), 1);
        assert!(matches!(guild.validate_for(&member("a")), Err(GuildError::Config(_))));

        let guild = Guild::new(GuildName::new("ops").unwrap()).with_member(member("a"), 1);
        assert!(guild.validate_for(&member("a")).is_ok());
        assert!(matches!(
            guild.validate_for(&member("b")),
            Err(GuildError::NotMember { .. })
        ));
    }
}
