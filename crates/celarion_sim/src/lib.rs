//! CELARION Deterministic Simulation
//!
//! Runs a guild of in-process replicas over a simulated network. Delivery
//! order, loss, duplicates and member ticks all come from one seed, so any
//! run can be reproduced exactly.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod harness;
pub mod network;
pub mod record;
pub mod seed;

pub use harness::{EditOutcome, MemberOutcome, Proposal, SimConfig, SimError, SimHarness, SimResult};
pub use network::{Delivery, NetworkConditions, SimNetwork};
pub use record::{SimEvent, SimRecord};
pub use seed::SimSeed;
