//! The register-cache store.

use crate::config::StoreConfig;
use crate::line::{CacheLine, Register, RegisterValue};
use async_trait::async_trait;
use celarion_core::{CoreError, Locator, LogicalTime, Value};
use celarion_proof::{LocatorLookup, LocatorResolver};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Store error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// No valid line and no backing source produced one
    #[error("Unresolved locator @{locator} (invalidated: {invalidated})")]
    Unresolved {
        /// Locator that missed
        locator: Locator,
        /// True if a flushed line exists
        invalidated: bool,
    },

    /// Backing source did not answer before the deadline
    #[error("Load of @{locator} timed out after {deadline_ms}ms")]
    Timeout {
        /// Locator being loaded
        locator: Locator,
        /// Deadline that expired
        deadline_ms: u64,
    },

    /// Backing source failed
    #[error("Load of @{locator} failed: {reason}")]
    Loader {
        /// Locator being loaded
        locator: Locator,
        /// Failure reason
        reason: String,
    },

    /// Register table full
    #[error("Register capacity {0} exhausted")]
    RegisterCapacity(usize),

    /// Line capacity is zero
    #[error("Store has no line capacity")]
    NoLineCapacity,

    /// A lock was poisoned by a panicking holder
    #[error("Store lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl From<CacheError> for CoreError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Timeout { locator, .. } => CoreError::Timeout {
                operation: format!("load @{}", locator),
            },
            CacheError::RegisterCapacity(limit) => CoreError::CapacityExceeded {
                resource: "registers".to_string(),
                limit: limit as u64,
            },
            other => CoreError::Validation {
                field: "store".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Backing source consulted on prefetch misses
#[async_trait]
pub trait LineLoader: Send + Sync {
    /// Load the value for `locator`, `None` if the source has none
    async fn load(&self, locator: &Locator) -> Result<Option<Value>, CacheError>;
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Prefetches served from a valid line
    pub hits: u64,
    /// Prefetches that found no valid line
    pub misses: u64,
    /// Lines removed to make room
    pub evictions: u64,
    /// Lines invalidated by flush
    pub flushes: u64,
}

type LineSlot = Arc<Mutex<CacheLine>>;

/// Capacity-bounded register and cache-line store
pub struct RegisterCacheStore {
    config: StoreConfig,
    lines: RwLock<IndexMap<Locator, LineSlot>>,
    registers: RwLock<IndexMap<String, RegisterValue>>,
    clock: AtomicU64,
    stats: Mutex<StoreStats>,
    loader: Option<Arc<dyn LineLoader>>,
}

impl RegisterCacheStore {
    /// Create a store with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create with custom configuration
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            lines: RwLock::new(IndexMap::new()),
            registers: RwLock::new(IndexMap::new()),
            clock: AtomicU64::new(0),
            stats: Mutex::new(StoreStats::default()),
            loader: None,
        }
    }

    /// Attach a backing source for prefetch misses
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn LineLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Get configuration
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn tick(&self) -> LogicalTime {
        LogicalTime::from_raw(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn slot(&self, locator: &Locator) -> Result<Option<LineSlot>, CacheError> {
        let index = self
            .lines
            .read()
            .map_err(|_| CacheError::Poisoned("line index"))?;
        Ok(index.get(locator).cloned())
    }

    fn update_stats(&self, f: impl FnOnce(&mut StoreStats)) -> Result<(), CacheError> {
        let mut stats = self
            .stats
            .lock()
            .map_err(|_| CacheError::Poisoned("stats"))?;
        f(&mut stats);
        Ok(())
    }

    /// Get a register, creating it empty if absent
    ///
    /// # Errors
    ///
    /// Returns `RegisterCapacity` if a new register does not fit
    pub fn acquire(&self, name: &str) -> Result<Register, CacheError> {
        let mut registers = self
            .registers
            .write()
            .map_err(|_| CacheError::Poisoned("registers"))?;
        if let Some(value) = registers.get(name) {
            return Ok(Register {
                name: name.to_string(),
                value: value.clone(),
            });
        }
        if registers.len() >= self.config.register_capacity {
            return Err(CacheError::RegisterCapacity(self.config.register_capacity));
        }
        registers.insert(name.to_string(), RegisterValue::Empty);
        trace!(register = name, "register acquired");
        Ok(Register::new(name))
    }

    /// Store into a register, acquiring it first
    ///
    /// # Errors
    ///
    /// Returns `RegisterCapacity` if a new register does not fit
    pub fn set_register(&self, name: &str, value: RegisterValue) -> Result<(), CacheError> {
        self.acquire(name)?;
        let mut registers = self
            .registers
            .write()
            .map_err(|_| CacheError::Poisoned("registers"))?;
        registers.insert(name.to_string(), value);
        Ok(())
    }

    /// Value held by a register, following a line reference if valid
    ///
    /// # Errors
    ///
    /// Returns error if a lock is poisoned
    pub fn register_value(&self, name: &str) -> Result<Option<Value>, CacheError> {
        let contents = {
            let registers = self
                .registers
                .read()
                .map_err(|_| CacheError::Poisoned("registers"))?;
            registers.get(name).cloned()
        };
        Ok(match contents {
            Some(RegisterValue::Scalar(value)) => Some(value),
            Some(RegisterValue::Line(locator)) => match self.lookup(&locator)? {
                LocatorLookup::Valid(value) => Some(value),
                LocatorLookup::Invalidated | LocatorLookup::Unknown => None,
            },
            Some(RegisterValue::Empty) | None => None,
        })
    }

    /// Write a line, validating it; evicts when a new line does not fit
    ///
    /// # Errors
    ///
    /// Returns error if the store has no line capacity or a lock is poisoned
    pub fn write_line(&self, locator: Locator, value: Value) -> Result<CacheLine, CacheError> {
        let now = self.tick();

        if let Some(slot) = self.slot(&locator)? {
            let mut line = slot.lock().map_err(|_| CacheError::Poisoned("line"))?;
            line.value = value;
            line.valid = true;
            line.validated_at = now;
            return Ok(line.clone());
        }

        if self.config.line_capacity == 0 {
            return Err(CacheError::NoLineCapacity);
        }

        let mut index = self
            .lines
            .write()
            .map_err(|_| CacheError::Poisoned("line index"))?;

        // Another writer may have inserted it since the read above
        if let Some(slot) = index.get(&locator) {
            let mut line = slot.lock().map_err(|_| CacheError::Poisoned("line"))?;
            line.value = value;
            line.valid = true;
            line.validated_at = now;
            return Ok(line.clone());
        }

        while index.len() >= self.config.line_capacity {
            self.evict_one(&mut index)?;
        }

        let line = CacheLine::new(locator.clone(), value, now);
        index.insert(locator, Arc::new(Mutex::new(line.clone())));
        Ok(line)
    }

    fn evict_one(&self, index: &mut IndexMap<Locator, LineSlot>) -> Result<(), CacheError> {
        // Invalid lines sort before valid ones, then oldest validation first
        let mut victim: Option<((bool, LogicalTime), usize)> = None;
        for (position, slot) in index.values().enumerate() {
            let line = slot.lock().map_err(|_| CacheError::Poisoned("line"))?;
            let key = (line.valid, line.validated_at);
            if victim.as_ref().is_none_or(|(best, _)| key < *best) {
                victim = Some((key, position));
            }
        }

        if let Some((_, position)) = victim {
            if let Some((locator, _)) = index.shift_remove_index(position) {
                debug!(%locator, "evicted cache line");
                self.update_stats(|s| s.evictions += 1)?;
            }
        }
        Ok(())
    }

    /// Look a line up without touching it
    ///
    /// # Errors
    ///
    /// Returns error if a lock is poisoned
    pub fn lookup(&self, locator: &Locator) -> Result<LocatorLookup, CacheError> {
        let Some(slot) = self.slot(locator)? else {
            return Ok(LocatorLookup::Unknown);
        };
        let line = slot.lock().map_err(|_| CacheError::Poisoned("line"))?;
        Ok(if line.valid {
            LocatorLookup::Valid(line.value)
        } else {
            LocatorLookup::Invalidated
        })
    }

    /// Invalidate a line, leaving a tombstone. Returns false if there was no line.
    ///
    /// # Errors
    ///
    /// Returns error if a lock is poisoned
    pub fn flush(&self, locator: &Locator) -> Result<bool, CacheError> {
        let Some(slot) = self.slot(locator)? else {
            return Ok(false);
        };
        {
            let mut line = slot.lock().map_err(|_| CacheError::Poisoned("line"))?;
            line.valid = false;
        }
        debug!(%locator, "flushed cache line");
        self.update_stats(|s| s.flushes += 1)?;
        Ok(true)
    }

    /// Make a line valid, loading it from the backing source on a miss
    ///
    /// # Errors
    ///
    /// Returns `Unresolved` if no valid value can be produced, `Timeout` if
    /// the backing source misses its deadline
    pub async fn prefetch(&self, locator: &Locator) -> Result<CacheLine, CacheError> {
        let tombstone = match self.slot(locator)? {
            Some(slot) => {
                let now = self.tick();
                let mut line = slot.lock().map_err(|_| CacheError::Poisoned("line"))?;
                if line.valid {
                    line.validated_at = now;
                    let hit = line.clone();
                    drop(line);
                    self.update_stats(|s| s.hits += 1)?;
                    return Ok(hit);
                }
                true
            }
            None => false,
        };
        self.update_stats(|s| s.misses += 1)?;

        let Some(loader) = self.loader.clone() else {
            return Err(CacheError::Unresolved {
                locator: locator.clone(),
                invalidated: tombstone,
            });
        };

        let deadline = self.config.load_deadline();
        let loaded = tokio::time::timeout(deadline, loader.load(locator))
            .await
            .map_err(|_| {
                warn!(%locator, deadline_ms = self.config.load_deadline_ms, "line load timed out");
                CacheError::Timeout {
                    locator: locator.clone(),
                    deadline_ms: self.config.load_deadline_ms,
                }
            })??;

        match loaded {
            Some(value) => self.write_line(locator.clone(), value),
            None => Err(CacheError::Unresolved {
                locator: locator.clone(),
                invalidated: tombstone,
            }),
        }
    }

    /// Number of lines, tombstones included
    ///
    /// # Errors
    ///
    /// Returns error if the index lock is poisoned
    pub fn line_count(&self) -> Result<usize, CacheError> {
        Ok(self
            .lines
            .read()
            .map_err(|_| CacheError::Poisoned("line index"))?
            .len())
    }

    /// Snapshot of the statistics
    ///
    /// # Errors
    ///
    /// Returns error if the stats lock is poisoned
    pub fn stats(&self) -> Result<StoreStats, CacheError> {
        Ok(self
            .stats
            .lock()
            .map_err(|_| CacheError::Poisoned("stats"))?
            .clone())
    }
}

impl Default for RegisterCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegisterCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterCacheStore")
            .field("config", &self.config)
            .field("has_loader", &self.loader.is_some())
            .finish_non_exhaustive()
    }
}

impl LocatorResolver for RegisterCacheStore {
    fn lookup(&self, locator: &Locator) -> LocatorLookup {
        RegisterCacheStore::lookup(self, locator).unwrap_or_else(|err| {
            warn!(%locator, %err, "lookup failed");
            LocatorLookup::Unknown
        })
    }

    fn register(&self, name: &str) -> Option<Value> {
        self.register_value(name).unwrap_or_else(|err| {
            warn!(register = name, %err, "register read failed");
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn loc(name: &str) -> Locator {
        Locator::new(name).unwrap()
    }

    struct FixedLoader(i64);

    #[async_trait]
    impl LineLoader for FixedLoader {
        async fn load(&self, _locator: &Locator) -> Result<Option<Value>, CacheError> {
            Ok(Some(Value::Int(self.0)))
        }
    }

    struct SlowLoader;

    #[async_trait]
    impl LineLoader for SlowLoader {
        async fn load(&self, _locator: &Locator) -> Result<Option<Value>, CacheError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(None)
        }
    }

    #[test]
    fn test_flush_leaves_tombstone() {
        let store = RegisterCacheStore::new();
        assert_eq!(store.lookup(&loc("a")).unwrap(), LocatorLookup::Unknown);

        store.write_line(loc("a"), Value::Int(1)).unwrap();
        assert_eq!(store.lookup(&loc("a")).unwrap(), LocatorLookup::Valid(Value::Int(1)));

        assert!(store.flush(&loc("a")).unwrap());
        assert_eq!(store.lookup(&loc("a")).unwrap(), LocatorLookup::Invalidated);
        assert_eq!(store.line_count().unwrap(), 1);
        assert!(!store.flush(&loc("never")).unwrap());
    }

    #[test]
    fn test_evicts_invalid_before_older_valid() {
        let store = RegisterCacheStore::with_config(StoreConfig::new().with_line_capacity(2));
        store.write_line(loc("a"), Value::Int(1)).unwrap();
        store.write_line(loc("b"), Value::Int(2)).unwrap();
        store.flush(&loc("b")).unwrap();

        store.write_line(loc("c"), Value::Int(3)).unwrap();
        assert_eq!(store.lookup(&loc("b")).unwrap(), LocatorLookup::Unknown);
        assert_eq!(store.lookup(&loc("a")).unwrap(), LocatorLookup::Valid(Value::Int(1)));
        assert_eq!(store.stats().unwrap().evictions, 1);
    }

    #[test]
    fn test_evicts_oldest_when_all_valid() {
        let store = RegisterCacheStore::with_config(StoreConfig::new().with_line_capacity(2));
        store.write_line(loc("a"), Value::Int(1)).unwrap();
        store.write_line(loc("b"), Value::Int(2)).unwrap();
        // Revalidate a so b becomes the oldest
        store.write_line(loc("a"), Value::Int(10)).unwrap();

        store.write_line(loc("c"), Value::Int(3)).unwrap();
        assert_eq!(store.lookup(&loc("b")).unwrap(), LocatorLookup::Unknown);
        assert_eq!(store.lookup(&loc("a")).unwrap(), LocatorLookup::Valid(Value::Int(10)));
    }

    #[test]
    fn test_register_capacity_and_line_reference() {
        let store = RegisterCacheStore::with_config(StoreConfig::new().with_register_capacity(1));
        store.write_line(loc("core"), Value::Int(5)).unwrap();
        store
            .set_register("r0", RegisterValue::Line(loc("core")))
            .unwrap();
        assert_eq!(store.register_value("r0").unwrap(), Some(Value::Int(5)));

        store.flush(&loc("core")).unwrap();
        assert_eq!(store.register_value("r0").unwrap(), None);

        assert_eq!(store.acquire("r1"), Err(CacheError::RegisterCapacity(1)));
        assert_eq!(store.acquire("r0").unwrap().value, RegisterValue::Line(loc("core")));
    }

    #[tokio::test]
    async fn test_prefetch_hit_and_miss() {
        let store = RegisterCacheStore::new();
        let err = store.prefetch(&loc("ufo")).await.unwrap_err();
        assert_eq!(
            err,
            CacheError::Unresolved {
                locator: loc("ufo"),
                invalidated: false
            }
        );

        store.write_line(loc("ufo"), Value::Int(2)).unwrap();
        let line = store.prefetch(&loc("ufo")).await.unwrap();
        assert!(line.valid);

        let stats = store.stats().unwrap();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_prefetch_loads_after_flush() {
        let store = RegisterCacheStore::new().with_loader(Arc::new(FixedLoader(42)));
        store.write_line(loc("core"), Value::Int(1)).unwrap();
        store.flush(&loc("core")).unwrap();

        let line = store.prefetch(&loc("core")).await.unwrap();
        assert_eq!(line.value, Value::Int(42));
        assert_eq!(store.lookup(&loc("core")).unwrap(), LocatorLookup::Valid(Value::Int(42)));
    }

    #[tokio::test]
    async fn test_prefetch_deadline() {
        let store = RegisterCacheStore::with_config(
            StoreConfig::new().with_load_deadline(Duration::from_millis(20)),
        )
        .with_loader(Arc::new(SlowLoader));

        let err = store.prefetch(&loc("slow")).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { deadline_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_writers_respect_capacity() {
        let store = Arc::new(RegisterCacheStore::with_config(
            StoreConfig::new().with_line_capacity(8),
        ));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..16 {
                    let locator = Locator::new(format!("w{}_{}", worker, i)).unwrap();
                    store.write_line(locator.clone(), Value::Int(i)).unwrap();
                    if i % 3 == 0 {
                        store.flush(&locator).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(store.line_count().unwrap() <= 8);
    }

    proptest! {
        #[test]
        fn prop_line_count_bounded(ops in proptest::collection::vec((0u8..12, any::<bool>()), 0..64)) {
            let store = RegisterCacheStore::with_config(StoreConfig::new().with_line_capacity(4));
            for (key, flush) in ops {
                let locator = Locator::new(format!("l{}", key)).unwrap();
                if flush {
                    store.flush(&locator).unwrap();
                } else {
                    store.write_line(locator, Value::Int(i64::from(key))).unwrap();
                }
                prop_assert!(store.line_count().unwrap() <= 4);
            }
        }
    }
}
