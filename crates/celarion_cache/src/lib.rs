//! CELARION Register-Cache Store
//!
//! Named registers and capacity-bounded cache lines addressed by locator.
//! Flushing leaves a tombstone so later lookups can tell a flushed line
//! from one that never existed. Each line sits behind its own lock; the
//! index lock is only held to find, insert or evict lines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod line;
pub mod store;

pub use config::StoreConfig;
pub use line::{CacheLine, Register, RegisterValue};
pub use store::{CacheError, LineLoader, RegisterCacheStore, StoreStats};
