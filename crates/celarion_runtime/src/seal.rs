//! Fallback seals and error-locks.
//!
//! A seal is a per-vault-key mutual exclusion. A branch takes the seal on
//! its first write to the key and holds it until the branch exits. When a
//! branch fails fatally or panics, every seal it holds is poisoned and
//! later acquisitions fail with [`ExecError::SealBreach`] until `reset`.

use crate::error::ExecError;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct SealState {
    lock: Arc<tokio::sync::Mutex<()>>,
    poisoned: AtomicBool,
}

/// Registry of seals keyed by vault key
#[derive(Debug, Default)]
pub struct SealRegistry {
    seals: Mutex<IndexMap<String, Arc<SealState>>>,
}

impl SealRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, key: &str) -> Result<Arc<SealState>, ExecError> {
        let mut seals = self
            .seals
            .lock()
            .map_err(|_| ExecError::Internal("seal registry lock poisoned".to_string()))?;
        Ok(Arc::clone(seals.entry(key.to_string()).or_default()))
    }

    /// Wait for the seal on `key`
    ///
    /// # Errors
    ///
    /// Returns `SealBreach` if the seal is poisoned, before or while waiting
    pub async fn acquire(&self, key: &str) -> Result<SealGuard, ExecError> {
        let state = self.state(key)?;
        if state.poisoned.load(Ordering::SeqCst) {
            return Err(ExecError::SealBreach {
                key: key.to_string(),
            });
        }

        let guard = Arc::clone(&state.lock).lock_owned().await;

        // Poisoned by the previous holder while we waited
        if state.poisoned.load(Ordering::SeqCst) {
            return Err(ExecError::SealBreach {
                key: key.to_string(),
            });
        }

        debug!(key, "seal acquired");
        Ok(SealGuard {
            key: key.to_string(),
            state,
            guard: Some(guard),
        })
    }

    /// True if the seal on `key` is poisoned
    #[must_use]
    pub fn is_poisoned(&self, key: &str) -> bool {
        self.seals
            .lock()
            .map(|seals| {
                seals
                    .get(key)
                    .is_some_and(|s| s.poisoned.load(Ordering::SeqCst))
            })
            .unwrap_or(true)
    }

    /// Clear the poison on `key`; returns true if it was poisoned
    ///
    /// # Errors
    ///
    /// Returns error if the registry lock is poisoned
    pub fn reset(&self, key: &str) -> Result<bool, ExecError> {
        let state = self.state(key)?;
        let was = state.poisoned.swap(false, Ordering::SeqCst);
        if was {
            info!(key, "seal reset");
        }
        Ok(was)
    }

    /// Keys whose seals are poisoned
    #[must_use]
    pub fn poisoned_keys(&self) -> Vec<String> {
        self.seals
            .lock()
            .map(|seals| {
                seals
                    .iter()
                    .filter(|(_, s)| s.poisoned.load(Ordering::SeqCst))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A held seal. Dropping it releases the seal, or poisons it when dropped
/// during a panic.
#[derive(Debug)]
pub struct SealGuard {
    key: String,
    state: Arc<SealState>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SealGuard {
    /// Vault key this seal protects
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release without poisoning
    pub fn release(mut self) {
        self.guard.take();
        debug!(key = %self.key, "seal released");
    }

    /// Poison, then release
    pub fn poison(mut self) {
        self.state.poisoned.store(true, Ordering::SeqCst);
        self.guard.take();
        warn!(key = %self.key, "seal poisoned");
    }
}

impl Drop for SealGuard {
    fn drop(&mut self) {
        if self.guard.is_some() && std::thread::panicking() {
            self.state.poisoned.store(true, Ordering::SeqCst);
            warn!(key = %self.key, "seal poisoned by panic");
        }
    }
}

/// Seals held by one branch, in acquisition order
#[derive(Debug)]
pub struct SealSet {
    registry: Arc<SealRegistry>,
    held: IndexMap<String, SealGuard>,
}

impl SealSet {
    /// Create an empty set over `registry`
    #[must_use]
    pub fn new(registry: Arc<SealRegistry>) -> Self {
        Self {
            registry,
            held: IndexMap::new(),
        }
    }

    /// Acquire the seal on `key` unless already held
    ///
    /// # Errors
    ///
    /// Returns `SealBreach` if the seal is poisoned
    pub async fn ensure(&mut self, key: &str) -> Result<(), ExecError> {
        if self.held.contains_key(key) {
            return Ok(());
        }
        let guard = self.registry.acquire(key).await?;
        self.held.insert(key.to_string(), guard);
        Ok(())
    }

    /// True if this set holds `key`
    #[must_use]
    pub fn holds(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    /// Registry the set draws from
    #[must_use]
    pub fn registry(&self) -> &Arc<SealRegistry> {
        &self.registry
    }

    /// Keys held
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.held.keys().map(String::as_str)
    }

    /// Release every held seal
    pub fn release_all(&mut self) {
        for (_, guard) in self.held.drain(..) {
            guard.release();
        }
    }

    /// Poison and release every held seal
    pub fn poison_all(&mut self) {
        for (_, guard) in self.held.drain(..) {
            guard.poison();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_seal_excludes_second_holder() {
        let registry = Arc::new(SealRegistry::new());
        let guard = registry.acquire("counter").await.unwrap();

        let contender = Arc::clone(&registry);
        let waiting = tokio::spawn(async move { contender.acquire("counter").await.map(|g| g.release()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        guard.release();
        waiting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_poisoned_seal_breaches_until_reset() {
        let registry = SealRegistry::new();
        registry.acquire("counter").await.unwrap().poison();
        assert!(registry.is_poisoned("counter"));

        let err = registry.acquire("counter").await.unwrap_err();
        assert_eq!(err, ExecError::SealBreach { key: "counter".into() });
        assert_eq!(registry.poisoned_keys(), vec!["counter".to_string()]);

        assert!(registry.reset("counter").unwrap());
        registry.acquire("counter").await.unwrap().release();
        assert!(!registry.reset("counter").unwrap());
    }

    #[tokio::test]
    async fn test_waiter_sees_poison_from_holder() {
        let registry = Arc::new(SealRegistry::new());
        let guard = registry.acquire("k").await.unwrap();

        let contender = Arc::clone(&registry);
        let waiting = tokio::spawn(async move { contender.acquire("k").await.map(|g| g.release()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.poison();

        let result = waiting.await.unwrap();
        assert_eq!(result, Err(ExecError::SealBreach { key: "k".into() }));
    }

    #[tokio::test]
    async fn test_panic_poisons_held_seal() {
        let registry = Arc::new(SealRegistry::new());
        let holder = Arc::clone(&registry);
        let task = tokio::spawn(async move {
            let _guard = holder.acquire("vault").await.unwrap();
            panic!("branch blew up");
        });
        assert!(task.await.is_err());
        assert!(registry.is_poisoned("vault"));
    }

    #[tokio::test]
    async fn test_seal_set_holds_once() {
        let registry = Arc::new(SealRegistry::new());
        let mut set = SealSet::new(Arc::clone(&registry));
        set.ensure("a").await.unwrap();
        set.ensure("a").await.unwrap();
        set.ensure("b").await.unwrap();
        assert_eq!(set.keys().collect::<Vec<_>>(), vec!["a", "b"]);

        set.poison_all();
        assert!(registry.is_poisoned("a"));
        assert!(registry.is_poisoned("b"));
        assert!(!set.holds("a"));
    }
}
