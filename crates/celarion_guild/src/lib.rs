//! CELARION GuildSync
//!
//! Replicates rule set edits across the members of a guild. Each edit moves
//! through `Proposed → Validating → {Accepted | Conflicted} → {Committed |
//! Rejected}`. Concurrent proposals against the same base version form a
//! round that is resolved deterministically on every member, so replicas
//! converge whatever order messages arrive in.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod membership;
pub mod message;
pub mod node;
pub mod sync;
pub mod transport;

pub use config::{GuildConfig, NodeConfig, RetryPolicy, SyncConfig};
pub use conflict::{ConflictRecord, Contender};
pub use coordinator::{send_with_retry, CoordinatorReport, GuildCoordinator};
pub use error::{GuildError, TransportError};
pub use membership::{Guild, GuildMember, RosterEntry};
pub use message::{Envelope, GuildMessage, VoteOutcome};
pub use node::GuildNode;
pub use sync::{EditState, GuildSync, Outgoing};
pub use transport::{MemoryNetwork, MemoryTransport, PeerTransport};
