//! The single-writer rule set.

use crate::directive::{Directive, Mutability};
use crate::edit::RuleEdit;
use crate::vault::Vault;
use celarion_core::{CanonicalEncode, CoreError, DirectiveId, Hash, NodeId, RuleVersion};
use celarion_graph::StreamGraph;
use celarion_proof::ProofChain;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Rule set errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// No such directive
    #[error("Unknown directive {0}")]
    UnknownDirective(DirectiveId),

    /// Define of an id already present
    #[error("Directive {0} already defined")]
    DuplicateDirective(DirectiveId),

    /// Toggle or freeze of an immutable directive
    #[error("Directive {0} is immutable")]
    ImmutableDirective(DirectiveId),

    /// Edit of a deprecated directive
    #[error("Directive {0} is deprecated")]
    Deprecated(DirectiveId),

    /// Body references a node outside the graph
    #[error("Directive {directive} references unknown {node}")]
    UnknownNode {
        /// Directive with the bad body
        directive: DirectiveId,
        /// Missing node
        node: NodeId,
    },

    /// Parent directive is missing
    #[error("Directive {directive} extends unknown {parent}")]
    UnknownParent {
        /// Child directive
        directive: DirectiveId,
        /// Missing parent
        parent: DirectiveId,
    },

    /// Inheritance loops back on itself
    #[error("Inheritance cycle through {0}")]
    InheritanceCycle(DirectiveId),
}

impl From<RuleError> for CoreError {
    fn from(err: RuleError) -> Self {
        match err {
            RuleError::UnknownDirective(id) => CoreError::NotFound {
                kind: "directive".to_string(),
                id: id.to_string(),
            },
            RuleError::DuplicateDirective(id) => CoreError::AlreadyExists {
                kind: "directive".to_string(),
                id: id.to_string(),
            },
            other => CoreError::Validation {
                field: "directive".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Serializable view of a rule set without its vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetSnapshot {
    /// Version
    pub version: RuleVersion,
    /// Directives in definition order
    pub directives: Vec<Directive>,
}

impl CanonicalEncode for RuleSetSnapshot {}

/// Versioned directive collection over a compiled stream graph
#[derive(Debug, Clone)]
pub struct RuleSet {
    version: RuleVersion,
    directives: IndexMap<DirectiveId, Directive>,
    graph: Arc<StreamGraph>,
    vault: Vault,
}

impl RuleSet {
    /// Create an empty rule set at version 0
    #[must_use]
    pub fn new(graph: Arc<StreamGraph>) -> Self {
        Self {
            version: RuleVersion::INITIAL,
            directives: IndexMap::new(),
            graph,
            vault: Vault::new(),
        }
    }

    /// Current version
    #[must_use]
    pub fn version(&self) -> RuleVersion {
        self.version
    }

    /// Compiled graph
    #[must_use]
    pub fn graph(&self) -> &Arc<StreamGraph> {
        &self.graph
    }

    /// Vault handle
    #[must_use]
    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Get a directive
    #[must_use]
    pub fn get(&self, id: &DirectiveId) -> Option<&Directive> {
        self.directives.get(id)
    }

    /// Directives in definition order, deprecated ones included
    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.directives.values()
    }

    /// Directives that are not deprecated
    pub fn active(&self) -> impl Iterator<Item = &Directive> {
        self.directives.values().filter(|d| !d.is_deprecated())
    }

    /// Parent conditions followed by the directive's own
    ///
    /// # Errors
    ///
    /// Returns error if the directive or an ancestor is missing, or the
    /// inheritance loops
    pub fn effective_condition(&self, id: &DirectiveId) -> Result<ProofChain, RuleError> {
        let mut lineage: Vec<&Directive> = Vec::new();
        let mut seen = IndexSet::new();
        let mut current = Some(id.clone());

        while let Some(cursor) = current {
            if !seen.insert(cursor.clone()) {
                return Err(RuleError::InheritanceCycle(cursor));
            }
            let Some(directive) = self.directives.get(&cursor) else {
                return Err(match lineage.last() {
                    Some(child) => RuleError::UnknownParent {
                        directive: child.id.clone(),
                        parent: cursor,
                    },
                    None => RuleError::UnknownDirective(cursor),
                });
            };
            lineage.push(directive);
            current = directive.extends.clone();
        }

        Ok(lineage
            .iter()
            .rev()
            .fold(ProofChain::new(), |acc, d| acc.extended_by(&d.condition)))
    }

    fn check_body(&self, directive: &DirectiveId, body: &[NodeId]) -> Result<(), RuleError> {
        for node in body {
            if self.graph.node(*node).is_err() {
                return Err(RuleError::UnknownNode {
                    directive: directive.clone(),
                    node: *node,
                });
            }
        }
        Ok(())
    }

    fn editable(&self, id: &DirectiveId) -> Result<&Directive, RuleError> {
        let directive = self
            .directives
            .get(id)
            .ok_or_else(|| RuleError::UnknownDirective(id.clone()))?;
        if directive.is_deprecated() {
            return Err(RuleError::Deprecated(id.clone()));
        }
        Ok(directive)
    }

    /// Check whether `edit` would apply cleanly
    ///
    /// # Errors
    ///
    /// Returns the reason the edit is invalid
    pub fn check(&self, edit: &RuleEdit) -> Result<(), RuleError> {
        match edit {
            RuleEdit::Define(directive) => {
                if self.directives.contains_key(&directive.id) {
                    return Err(RuleError::DuplicateDirective(directive.id.clone()));
                }
                if let Some(parent) = &directive.extends {
                    if !self.directives.contains_key(parent) {
                        return Err(RuleError::UnknownParent {
                            directive: directive.id.clone(),
                            parent: parent.clone(),
                        });
                    }
                }
                self.check_body(&directive.id, &directive.body)
            }
            RuleEdit::Toggle { id, body, .. } => {
                let directive = self.editable(id)?;
                if !directive.is_mutable() {
                    return Err(RuleError::ImmutableDirective(id.clone()));
                }
                match body {
                    Some(body) => self.check_body(id, body),
                    None => Ok(()),
                }
            }
            RuleEdit::Freeze { id } => {
                let directive = self.editable(id)?;
                if !directive.is_mutable() {
                    return Err(RuleError::ImmutableDirective(id.clone()));
                }
                Ok(())
            }
            RuleEdit::Deprecate { id, .. } => self.editable(id).map(|_| ()),
        }
    }

    /// Apply an edit, advancing the version by one
    ///
    /// # Errors
    ///
    /// Returns the reason the edit is invalid; the set is unchanged
    pub fn apply(&mut self, edit: &RuleEdit) -> Result<RuleVersion, RuleError> {
        self.check(edit)?;
        let next = self.version.next();

        match edit {
            RuleEdit::Define(directive) => {
                let mut directive = directive.clone();
                directive.version = next;
                directive.deprecated = None;
                self.directives.insert(directive.id.clone(), directive);
            }
            RuleEdit::Toggle {
                id,
                condition,
                body,
            } => {
                let directive = self
                    .directives
                    .get_mut(id)
                    .ok_or_else(|| RuleError::UnknownDirective(id.clone()))?;
                if let Some(condition) = condition {
                    directive.condition = condition.clone();
                }
                if let Some(body) = body {
                    directive.body = body.clone();
                }
                directive.version = next;
            }
            RuleEdit::Freeze { id } => {
                let directive = self
                    .directives
                    .get_mut(id)
                    .ok_or_else(|| RuleError::UnknownDirective(id.clone()))?;
                directive.mutability = Mutability::Immutable;
                directive.version = next;
            }
            RuleEdit::Deprecate { id, reason } => {
                let directive = self
                    .directives
                    .get_mut(id)
                    .ok_or_else(|| RuleError::UnknownDirective(id.clone()))?;
                directive.deprecated = Some(reason.clone());
                directive.version = next;
            }
        }

        self.version = next;
        debug!(edit = %edit, version = %next, "rule edit applied");
        Ok(next)
    }

    /// Serializable view
    #[must_use]
    pub fn snapshot(&self) -> RuleSetSnapshot {
        RuleSetSnapshot {
            version: self.version,
            directives: self.directives.values().cloned().collect(),
        }
    }

    /// Content hash of version and directives
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be encoded
    pub fn fingerprint(&self) -> Result<Hash, CoreError> {
        Ok(Hash::compute(&self.snapshot().encode()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celarion_graph::StreamNode;
    use celarion_proof::{Predicate, ProofStep};

    fn id(name: &str) -> DirectiveId {
        DirectiveId::new(name).unwrap()
    }

    fn graph() -> Arc<StreamGraph> {
        Arc::new(
            StreamGraph::from_parts(
                vec![StreamNode::trigger(0, vec![]), StreamNode::terminal(1)],
                vec![celarion_graph::Edge::trigger(0, 1)],
            )
            .unwrap(),
        )
    }

    fn step(p: Predicate) -> ProofChain {
        ProofChain::new().with_step(ProofStep::new(p))
    }

    #[test]
    fn test_define_advances_version() {
        let mut rules = RuleSet::new(graph());
        let v = rules
            .apply(&RuleEdit::Define(Directive::new(
                id("core"),
                ProofChain::new(),
                vec![NodeId(0)],
            )))
            .unwrap();
        assert_eq!(v, RuleVersion(1));
        assert_eq!(rules.get(&id("core")).unwrap().version, RuleVersion(1));
    }

    #[test]
    fn test_immutable_rejects_toggle() {
        let mut rules = RuleSet::new(graph());
        rules
            .apply(&RuleEdit::Define(
                Directive::new(id("core"), ProofChain::new(), vec![]).immutable(),
            ))
            .unwrap();

        let toggle = RuleEdit::Toggle {
            id: id("core"),
            condition: Some(step(Predicate::Never)),
            body: None,
        };
        assert_eq!(rules.check(&toggle), Err(RuleError::ImmutableDirective(id("core"))));
        assert_eq!(rules.apply(&toggle), Err(RuleError::ImmutableDirective(id("core"))));
        assert_eq!(rules.version(), RuleVersion(1));
    }

    #[test]
    fn test_freeze_then_toggle_fails() {
        let mut rules = RuleSet::new(graph());
        rules
            .apply(&RuleEdit::Define(Directive::new(id("d"), ProofChain::new(), vec![])))
            .unwrap();
        rules.apply(&RuleEdit::Freeze { id: id("d") }).unwrap();
        assert_eq!(rules.version(), RuleVersion(2));
        let toggle = RuleEdit::Toggle {
            id: id("d"),
            condition: None,
            body: Some(vec![NodeId(1)]),
        };
        assert!(rules.check(&toggle).is_err());
    }

    #[test]
    fn test_unknown_body_node_rejected() {
        let rules = RuleSet::new(graph());
        let edit = RuleEdit::Define(Directive::new(id("d"), ProofChain::new(), vec![NodeId(9)]));
        assert_eq!(
            rules.check(&edit),
            Err(RuleError::UnknownNode {
                directive: id("d"),
                node: NodeId(9)
            })
        );
    }

    #[test]
    fn test_deprecated_stays_auditable() {
        let mut rules = RuleSet::new(graph());
        rules
            .apply(&RuleEdit::Define(Directive::new(id("d"), ProofChain::new(), vec![])))
            .unwrap();
        rules
            .apply(&RuleEdit::Deprecate {
                id: id("d"),
                reason: "superseded".into(),
            })
            .unwrap();
        assert_eq!(rules.directives().count(), 1);
        assert_eq!(rules.active().count(), 0);
        assert_eq!(
            rules.check(&RuleEdit::Freeze { id: id("d") }),
            Err(RuleError::Deprecated(id("d")))
        );
    }

    #[test]
    fn test_effective_condition_inherits() {
        let mut rules = RuleSet::new(graph());
        rules
            .apply(&RuleEdit::Define(Directive::new(
                id("base"),
                step(Predicate::Bound("ready".into())),
                vec![],
            )))
            .unwrap();
        rules
            .apply(&RuleEdit::Define(
                Directive::new(id("child"), step(Predicate::Always), vec![]).extending(id("base")),
            ))
            .unwrap();

        let effective = rules.effective_condition(&id("child")).unwrap();
        assert_eq!(effective.len(), 2);
        assert_eq!(effective.steps()[0].predicate, Predicate::Bound("ready".into()));
        assert_eq!(
            rules.check(&RuleEdit::Define(
                Directive::new(id("orphan"), ProofChain::new(), vec![]).extending(id("nope"))
            )),
            Err(RuleError::UnknownParent {
                directive: id("orphan"),
                parent: id("nope")
            })
        );
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let g = graph();
        let mut a = RuleSet::new(Arc::clone(&g));
        let mut b = RuleSet::new(g);
        let edit = RuleEdit::Define(Directive::new(id("d"), ProofChain::new(), vec![]));
        a.apply(&edit).unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        b.apply(&edit).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }
}
