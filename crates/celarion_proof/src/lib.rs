//! CELARION Proof Engine
//!
//! Evaluates proof chains to a tri-state verdict over the lattice
//! `err_false < shadow_true < verified`. Evaluation only reads the
//! register-cache store through [`LocatorResolver`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bindings;
pub mod chain;
pub mod confidence;
pub mod engine;
pub mod verdict;

pub use bindings::Bindings;
pub use chain::{CompareOp, Operand, Predicate, ProofChain, ProofStep, RangeConstraint};
pub use confidence::{Confidence, ConfidenceScorer, StepRatioScorer};
pub use engine::{
    FailReason, LocatorLookup, LocatorResolver, ProofEngine, ProofError, ProofTrace,
    StepOutcome,
};
pub use verdict::Verdict;
