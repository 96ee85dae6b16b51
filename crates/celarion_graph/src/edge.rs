//! Typed edges between stream nodes.

use celarion_core::NodeId;
use celarion_proof::{Operand, ProofChain};
use serde::{Deserialize, Serialize};

/// Edge kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Control transfer, chosen by guard
    Trigger,
    /// Forwards bindings to the target's inbox
    Tracker,
    /// Reads or writes the vault slot named by the target
    Vault,
}

/// Operation carried by a vault edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultOp {
    /// Read the slot into a binding
    ReadInto(String),
    /// Write an operand's value into the slot
    Write(Operand),
}

/// A directed edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge kind
    pub kind: EdgeKind,
    /// Source node
    pub from: NodeId,
    /// Target node
    pub to: NodeId,
    /// Guard that must reach at least `shadow_true`
    #[serde(default)]
    pub guard: Option<ProofChain>,
    /// Taken when no guarded trigger edge passes
    #[serde(default)]
    pub fallback: bool,
    /// Bindings forwarded by a tracker edge; empty forwards all
    #[serde(default)]
    pub forward: Vec<String>,
    /// Vault operation
    #[serde(default)]
    pub vault: Option<VaultOp>,
}

impl Edge {
    fn new(kind: EdgeKind, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            guard: None,
            fallback: false,
            forward: Vec::new(),
            vault: None,
        }
    }

    /// Unguarded trigger edge
    #[must_use]
    pub fn trigger(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self::new(EdgeKind::Trigger, from, to)
    }

    /// Tracker edge forwarding every binding
    #[must_use]
    pub fn tracker(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self::new(EdgeKind::Tracker, from, to)
    }

    /// Vault edge
    #[must_use]
    pub fn vault(from: impl Into<NodeId>, to: impl Into<NodeId>, op: VaultOp) -> Self {
        let mut edge = Self::new(EdgeKind::Vault, from, to);
        edge.vault = Some(op);
        edge
    }

    /// Attach a guard
    #[must_use]
    pub fn guarded(mut self, guard: ProofChain) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Mark as the source's fallback
    #[must_use]
    pub fn as_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Restrict forwarded bindings
    #[must_use]
    pub fn forwarding(mut self, names: &[&str]) -> Self {
        self.forward = names.iter().map(|s| (*s).to_string()).collect();
        self
    }
}
