//! CELARION Stream Graph
//!
//! The executable form of a directive set: an arena of stream nodes
//! indexed by stable id, joined by trigger, tracker and vault edges.
//! Cycles are allowed; the stack engine bounds them at run time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod edge;
pub mod graph;
pub mod node;

pub use edge::{Edge, EdgeKind, VaultOp};
pub use graph::{GraphDocument, GraphError, StreamGraph};
pub use node::{Action, NodeKind, StreamNode};
