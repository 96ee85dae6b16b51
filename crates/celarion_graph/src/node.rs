//! Stream nodes and their actions.

use celarion_core::{Locator, NodeId};
use celarion_proof::Operand;
use serde::{Deserialize, Serialize};

/// Kind of stream node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Chooses one outgoing trigger edge by guard
    Branch,
    /// Runs its actions, then follows its trigger edges
    Trigger,
    /// Names a vault slot; target of vault edges
    VaultAccess {
        /// Vault key
        key: String,
    },
    /// Ends a run segment
    Terminal,
}

/// Side effect performed when a trigger node is dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Set a binding to an operand's value
    Set {
        /// Binding name
        name: String,
        /// Source operand
        value: Operand,
    },
    /// Add to an integer binding, creating it at zero
    Add {
        /// Binding name
        name: String,
        /// Amount added
        delta: i64,
    },
    /// Store an operand into a register; a locator operand stores a line reference
    Store {
        /// Register name
        register: String,
        /// Source operand
        value: Operand,
    },
    /// Load a register into a binding
    Load {
        /// Register name
        register: String,
        /// Binding name
        into: String,
    },
    /// Write a cache line
    WriteLine {
        /// Line address
        locator: Locator,
        /// Source operand
        value: Operand,
    },
    /// Make a cache line valid
    Prefetch(Locator),
    /// Invalidate a cache line
    Flush(Locator),
}

/// A node in the stream graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamNode {
    /// Stable id
    pub id: NodeId,
    /// Node kind
    pub kind: NodeKind,
    /// Actions run on dispatch
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Optional human label
    #[serde(default)]
    pub label: Option<String>,
}

impl StreamNode {
    /// Create a node
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            actions: Vec::new(),
            label: None,
        }
    }

    /// Branch node
    #[must_use]
    pub fn branch(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Branch)
    }

    /// Trigger node with actions
    #[must_use]
    pub fn trigger(id: impl Into<NodeId>, actions: Vec<Action>) -> Self {
        let mut node = Self::new(id, NodeKind::Trigger);
        node.actions = actions;
        node
    }

    /// Vault access node for `key`
    #[must_use]
    pub fn vault(id: impl Into<NodeId>, key: impl Into<String>) -> Self {
        Self::new(id, NodeKind::VaultAccess { key: key.into() })
    }

    /// Terminal node
    #[must_use]
    pub fn terminal(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Terminal)
    }

    /// Set the label
    #[must_use]
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// True for terminal nodes
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, NodeKind::Terminal)
    }

    /// Vault key for vault access nodes
    #[must_use]
    pub fn vault_key(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::VaultAccess { key } => Some(key),
            _ => None,
        }
    }
}
