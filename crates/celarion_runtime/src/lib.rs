//! CELARION Runtime
//!
//! Runs directive bodies over the stream graph with an explicit frame
//! stack, and supervises concurrent rule branches. Vault writes are
//! linearized per key by seals; a branch that fails fatally poisons the
//! seals it holds until they are reset.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod scope;
pub mod seal;

pub use config::{EngineConfig, SchedulerConfig};
pub use engine::{ExecutionResult, StackEngine};
pub use error::ExecError;
pub use scheduler::{BranchReport, BranchStatus, RuleBranch, Scheduler};
pub use scope::BranchScope;
pub use seal::{SealGuard, SealRegistry, SealSet};
