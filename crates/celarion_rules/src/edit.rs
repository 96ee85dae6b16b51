//! Versioned rule set edits.

use crate::directive::Directive;
use celarion_core::{CanonicalEncode, DirectiveId, NodeId};
use celarion_proof::ProofChain;
use serde::{Deserialize, Serialize};

/// An edit to a rule set. Every applied edit produces a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEdit {
    /// Add a new directive
    Define(Directive),
    /// Rewrite a mutable directive
    Toggle {
        /// Directive to rewrite
        id: DirectiveId,
        /// Replacement condition
        #[serde(default)]
        condition: Option<ProofChain>,
        /// Replacement body
        #[serde(default)]
        body: Option<Vec<NodeId>>,
    },
    /// Make a mutable directive immutable
    Freeze {
        /// Directive to freeze
        id: DirectiveId,
    },
    /// Retire a directive; it stays in the set for audit
    Deprecate {
        /// Directive to retire
        id: DirectiveId,
        /// Why
        reason: String,
    },
}

impl RuleEdit {
    /// Directive this edit targets
    #[must_use]
    pub fn target(&self) -> &DirectiveId {
        match self {
            Self::Define(d) => &d.id,
            Self::Toggle { id, .. } | Self::Freeze { id } | Self::Deprecate { id, .. } => id,
        }
    }

    /// Short name of the edit kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Define(_) => "define",
            Self::Toggle { .. } => "toggle",
            Self::Freeze { .. } => "freeze",
            Self::Deprecate { .. } => "deprecate",
        }
    }
}

impl CanonicalEncode for RuleEdit {}

impl std::fmt::Display for RuleEdit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.target())
    }
}
