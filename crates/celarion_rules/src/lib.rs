//! CELARION Rule Sets
//!
//! Directives, the versioned edits that change them, the single-writer
//! rule set, its vault of shared execution state, and the append-only
//! hash-chained log of committed edits.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod directive;
pub mod edit;
pub mod log;
pub mod ruleset;
pub mod vault;

pub use directive::{Directive, Mutability};
pub use edit::RuleEdit;
pub use log::{LogEntry, LogError, RuleLog};
pub use ruleset::{RuleError, RuleSet, RuleSetSnapshot};
pub use vault::Vault;
