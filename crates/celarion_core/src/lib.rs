//! CELARION Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! All types are serializable with stable, cross-platform encoding.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod exit;
pub mod hash;
pub mod id;
pub mod time;
pub mod value;
pub mod version;

// Re-exports
pub use encoding::{decode, CanonicalDecoder, CanonicalEncode, CanonicalEncoder, DecodeError, EncodeError};
pub use error::{CoreError, CoreResult};
pub use exit::ExitCode;
pub use hash::Hash;
pub use id::{BranchId, DirectiveId, EditId, GuildName, Locator, MemberId, NodeId};
pub use time::{LogicalTime, VectorClock};
pub use value::{RangedValue, Value, ValueRange};
pub use version::RuleVersion;
