//! Directives: named conditional rule units.

use celarion_core::{DirectiveId, NodeId, RuleVersion};
use celarion_proof::ProofChain;
use serde::{Deserialize, Serialize};

/// Whether a directive may be rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    /// Never rewritten
    Immutable,
    /// Rewritten only by a toggle edit
    Mutable,
}

/// A directive: guard condition plus a body of graph entry nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    /// Identifier
    pub id: DirectiveId,
    /// Rule set version that last changed this directive
    pub version: RuleVersion,
    /// Guard condition, before inheritance
    pub condition: ProofChain,
    /// Entry nodes run in order when the condition holds
    pub body: Vec<NodeId>,
    /// Mutability flag
    pub mutability: Mutability,
    /// Parent whose effective condition precedes this one's
    #[serde(default)]
    pub extends: Option<DirectiveId>,
    /// Deprecation reason, once retired
    #[serde(default)]
    pub deprecated: Option<String>,
}

impl Directive {
    /// Create a mutable directive
    #[must_use]
    pub fn new(id: DirectiveId, condition: ProofChain, body: Vec<NodeId>) -> Self {
        Self {
            id,
            version: RuleVersion::INITIAL,
            condition,
            body,
            mutability: Mutability::Mutable,
            extends: None,
            deprecated: None,
        }
    }

    /// Mark immutable
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.mutability = Mutability::Immutable;
        self
    }

    /// Inherit from `parent`
    #[must_use]
    pub fn extending(mut self, parent: DirectiveId) -> Self {
        self.extends = Some(parent);
        self
    }

    /// True if a toggle may rewrite this directive
    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.mutability == Mutability::Mutable
    }

    /// True once deprecated
    #[must_use]
    pub fn is_deprecated(&self) -> bool {
        self.deprecated.is_some()
    }
}
