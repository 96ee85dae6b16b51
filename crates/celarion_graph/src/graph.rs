//! The stream graph arena.

use crate::edge::{Edge, EdgeKind};
use crate::node::{NodeKind, StreamNode};
use celarion_core::{CoreError, NodeId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Graph error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Malformed graph; fatal to the load
    #[error("Parse error: {0}")]
    Parse(String),

    /// Lookup of a node that is not in the arena
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
}

impl From<GraphError> for CoreError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Parse(message) => CoreError::ParseError { message },
            GraphError::UnknownNode(id) => CoreError::NotFound {
                kind: "node".to_string(),
                id: id.to_string(),
            },
        }
    }
}

/// Serialized form of a graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDocument {
    /// Nodes in declaration order
    pub nodes: Vec<StreamNode>,
    /// Edges in declaration order
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Arena of stream nodes with typed edges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GraphDocument", into = "GraphDocument")]
pub struct StreamGraph {
    nodes: IndexMap<NodeId, StreamNode>,
    edges: Vec<Edge>,
    outgoing: IndexMap<NodeId, Vec<usize>>,
}

impl StreamGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a graph from its parts
    ///
    /// # Errors
    ///
    /// Returns `Parse` if the graph is malformed
    pub fn from_parts(nodes: Vec<StreamNode>, edges: Vec<Edge>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node)?;
        }
        for edge in edges {
            graph.add_edge(edge)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Parse and validate a JSON graph document
    ///
    /// # Errors
    ///
    /// Returns `Parse` if the JSON or the graph is malformed
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let doc: GraphDocument =
            serde_json::from_str(json).map_err(|e| GraphError::Parse(e.to_string()))?;
        Self::try_from(doc)
    }

    /// Add a node
    ///
    /// # Errors
    ///
    /// Returns `Parse` if the id is taken
    pub fn add_node(&mut self, node: StreamNode) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::Parse(format!("duplicate node id {}", node.id)));
        }
        self.nodes.insert(node.id, node);
        Ok(())
    }

    /// Add an edge
    ///
    /// # Errors
    ///
    /// Returns `Parse` if either endpoint is missing
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        for end in [edge.from, edge.to] {
            if !self.nodes.contains_key(&end) {
                return Err(GraphError::Parse(format!(
                    "edge {} -> {} references missing {}",
                    edge.from, edge.to, end
                )));
            }
        }
        self.outgoing
            .entry(edge.from)
            .or_default()
            .push(self.edges.len());
        self.edges.push(edge);
        Ok(())
    }

    /// Check structural rules
    ///
    /// # Errors
    ///
    /// Returns `Parse` naming the first rule broken
    pub fn validate(&self) -> Result<(), GraphError> {
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.from) || !self.nodes.contains_key(&edge.to) {
                return Err(GraphError::Parse(format!(
                    "dangling edge {} -> {}",
                    edge.from, edge.to
                )));
            }
            match edge.kind {
                EdgeKind::Trigger => {
                    if edge.fallback && edge.guard.is_some() {
                        return Err(GraphError::Parse(format!(
                            "fallback edge {} -> {} carries a guard",
                            edge.from, edge.to
                        )));
                    }
                    if edge.vault.is_some() {
                        return Err(GraphError::Parse(format!(
                            "trigger edge {} -> {} carries a vault operation",
                            edge.from, edge.to
                        )));
                    }
                }
                EdgeKind::Tracker => {
                    if edge.fallback || edge.guard.is_some() || edge.vault.is_some() {
                        return Err(GraphError::Parse(format!(
                            "tracker edge {} -> {} may only forward bindings",
                            edge.from, edge.to
                        )));
                    }
                }
                EdgeKind::Vault => {
                    if edge.vault.is_none() {
                        return Err(GraphError::Parse(format!(
                            "vault edge {} -> {} has no operation",
                            edge.from, edge.to
                        )));
                    }
                    if edge.fallback {
                        return Err(GraphError::Parse(format!(
                            "vault edge {} -> {} marked fallback",
                            edge.from, edge.to
                        )));
                    }
                    let target_is_vault = self
                        .nodes
                        .get(&edge.to)
                        .is_some_and(|n| matches!(n.kind, NodeKind::VaultAccess { .. }));
                    if !target_is_vault {
                        return Err(GraphError::Parse(format!(
                            "vault edge {} -> {} does not target a vault node",
                            edge.from, edge.to
                        )));
                    }
                }
            }
        }

        for (id, node) in &self.nodes {
            let fallbacks = self.trigger_edges(*id).filter(|e| e.fallback).count();
            if fallbacks > 1 {
                return Err(GraphError::Parse(format!(
                    "{} has {} fallback edges",
                    id, fallbacks
                )));
            }
            if node.is_terminal() && self.trigger_edges(*id).next().is_some() {
                return Err(GraphError::Parse(format!(
                    "terminal {} has outgoing trigger edges",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Check that `entry` exists
    ///
    /// # Errors
    ///
    /// Returns `Parse` if the entry is missing
    pub fn validate_entry(&self, entry: NodeId) -> Result<(), GraphError> {
        if self.nodes.contains_key(&entry) {
            Ok(())
        } else {
            Err(GraphError::Parse(format!("missing entry {}", entry)))
        }
    }

    /// Get a node
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if absent
    pub fn node(&self, id: NodeId) -> Result<&StreamNode, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    /// Outgoing edges of `id` in declaration order
    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|&i| self.edges.get(i))
    }

    /// Outgoing trigger edges of `id` in declaration order
    pub fn trigger_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.outgoing(id).filter(|e| e.kind == EdgeKind::Trigger)
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &StreamNode> {
        self.nodes.values()
    }

    /// All edges in declaration order
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no nodes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Vault keys named by vault access nodes
    #[must_use]
    pub fn vault_keys(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter_map(|n| n.vault_key().map(str::to_string))
            .collect()
    }
}

impl TryFrom<GraphDocument> for StreamGraph {
    type Error = GraphError;

    fn try_from(doc: GraphDocument) -> Result<Self, Self::Error> {
        Self::from_parts(doc.nodes, doc.edges)
    }
}

impl From<StreamGraph> for GraphDocument {
    fn from(graph: StreamGraph) -> Self {
        Self {
            nodes: graph.nodes.into_values().collect(),
            edges: graph.edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::VaultOp;
    use crate::node::Action;
    use celarion_proof::{Operand, Predicate, ProofChain, ProofStep};

    fn loop_graph() -> StreamGraph {
        StreamGraph::from_parts(
            vec![
                StreamNode::branch(0),
                StreamNode::trigger(
                    1,
                    vec![Action::Add {
                        name: "i".into(),
                        delta: 1,
                    }],
                ),
                StreamNode::vault(2, "counter"),
                StreamNode::terminal(3),
            ],
            vec![
                Edge::trigger(0, 3).guarded(
                    ProofChain::new().with_step(ProofStep::new(Predicate::Bound("done".into()))),
                ),
                Edge::trigger(0, 1).as_fallback(),
                Edge::vault(
                    1,
                    2,
                    VaultOp::Write(Operand::Binding("i".into())),
                ),
                Edge::trigger(1, 0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_cycles_are_allowed() {
        let graph = loop_graph();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.trigger_edges(NodeId(0)).count(), 2);
        assert_eq!(graph.outgoing(NodeId(1)).count(), 2);
        assert_eq!(graph.vault_keys(), vec!["counter".to_string()]);
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let err = StreamGraph::from_parts(
            vec![StreamNode::branch(0)],
            vec![Edge::trigger(0, 9)],
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::Parse(_)));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = StreamGraph::from_parts(
            vec![StreamNode::branch(0), StreamNode::terminal(0)],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err, GraphError::Parse("duplicate node id node#0".into()));
    }

    #[test]
    fn test_two_fallbacks_rejected() {
        let err = StreamGraph::from_parts(
            vec![
                StreamNode::branch(0),
                StreamNode::terminal(1),
                StreamNode::terminal(2),
            ],
            vec![
                Edge::trigger(0, 1).as_fallback(),
                Edge::trigger(0, 2).as_fallback(),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("fallback"));
    }

    #[test]
    fn test_vault_edge_must_target_vault_node() {
        let err = StreamGraph::from_parts(
            vec![StreamNode::trigger(0, vec![]), StreamNode::terminal(1)],
            vec![Edge::vault(0, 1, VaultOp::ReadInto("x".into()))],
        )
        .unwrap_err();
        assert!(err.to_string().contains("vault node"));
    }

    #[test]
    fn test_terminal_without_outgoing_triggers() {
        let err = StreamGraph::from_parts(
            vec![StreamNode::terminal(0), StreamNode::terminal(1)],
            vec![Edge::trigger(0, 1)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("terminal"));
    }

    #[test]
    fn test_missing_entry() {
        let graph = loop_graph();
        assert!(graph.validate_entry(NodeId(0)).is_ok());
        assert!(graph.validate_entry(NodeId(42)).is_err());
    }

    #[test]
    fn test_json_document_roundtrip() {
        let graph = loop_graph();
        let json = serde_json::to_string(&graph).unwrap();
        let back = StreamGraph::from_json(&json).unwrap();
        assert_eq!(graph, back);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = StreamGraph::from_json("{\"nodes\": 3}").unwrap_err();
        assert!(matches!(err, GraphError::Parse(_)));
        let core: CoreError = err.into();
        assert!(matches!(core, CoreError::ParseError { .. }));
    }
}
