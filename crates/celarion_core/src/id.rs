//! Identifiers for CELARION entities.
//!
//! Member, guild and directive identities are human-chosen names and order
//! lexicographically. Edits and branches use UUIDs. Stream nodes use a
//! stable integer index into the graph arena.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! named_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create from a name
            ///
            /// # Errors
            ///
            /// Returns error if the name is empty or contains whitespace
            pub fn new(name: impl Into<String>) -> CoreResult<Self> {
                let name = name.into();
                if name.is_empty() || name.chars().any(char::is_whitespace) {
                    return Err(CoreError::InvalidId {
                        reason: format!("{} name {:?} must be non-empty without whitespace", $kind, name),
                    });
                }
                Ok(Self(name))
            }

            /// Get the name
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

named_id!(
    /// Guild member identity
    MemberId,
    "member"
);

named_id!(
    /// Guild name
    GuildName,
    "guild"
);

named_id!(
    /// Directive identifier, unique within a rule set
    DirectiveId,
    "directive"
);

named_id!(
    /// Cache line address in the register-cache store
    Locator,
    "locator"
);

/// Edit identifier - idempotency key for every GuildSync message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EditId(Uuid);

impl EditId {
    /// Create a new random EditId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive an id from the author, base version and encoded edit payload.
    ///
    /// The same proposal always maps to the same id, so a re-sent proposal
    /// is recognised as a duplicate.
    #[must_use]
    pub fn derive(author: &MemberId, base_version: u64, payload: &[u8]) -> Self {
        let mut name = Vec::with_capacity(author.as_str().len() + 8 + payload.len());
        name.extend_from_slice(author.as_str().as_bytes());
        name.extend_from_slice(&base_version.to_be_bytes());
        name.extend_from_slice(payload);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, &name))
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for EditId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EditId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "edit_{}", self.0)
    }
}

/// Rule-branch identifier - one per scheduled directive run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(Uuid);

impl BranchId {
    /// Create a new random BranchId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for BranchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "branch_{}", self.0)
    }
}

/// Stream node identifier - stable index within one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Get raw index
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_id_rejects_empty() {
        assert!(MemberId::new("").is_err());
        assert!(GuildName::new("Dev Net").is_err());
        assert!(DirectiveId::new("core_directive").is_ok());
    }

    #[test]
    fn test_member_ids_order_lexicographically() {
        let a = MemberId::new("alpha").unwrap();
        let b = MemberId::new("beta").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_edit_id_derive_is_stable() {
        let author = MemberId::new("alpha").unwrap();
        let id1 = EditId::derive(&author, 3, b"payload");
        let id2 = EditId::derive(&author, 3, b"payload");
        assert_eq!(id1, id2);

        let id3 = EditId::derive(&author, 4, b"payload");
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_id_display() {
        assert!(EditId::new().to_string().starts_with("edit_"));
        assert!(BranchId::new().to_string().starts_with("branch_"));
        assert_eq!(NodeId(7).to_string(), "node#7");
    }

    #[test]
    fn test_named_id_from_str() {
        let guild: GuildName = "ProofNexus".parse().unwrap();
        assert_eq!(guild.as_str(), "ProofNexus");
    }
}
