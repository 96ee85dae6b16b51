//! Per-branch execution scope: seals, vault handle, cancellation.
//!
//! Vault writes stay pending in the scope until the branch releases its
//! seals. Other branches only ever read committed slots.

use crate::error::ExecError;
use crate::seal::{SealRegistry, SealSet};
use celarion_core::{BranchId, Value};
use celarion_rules::Vault;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a running branch owns besides its frames
#[derive(Debug)]
pub struct BranchScope {
    branch: BranchId,
    seals: SealSet,
    vault: Vault,
    pending: IndexMap<String, Value>,
    cancel: CancellationToken,
}

impl BranchScope {
    /// Create a scope
    #[must_use]
    pub fn new(
        branch: BranchId,
        registry: Arc<SealRegistry>,
        vault: Vault,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            branch,
            seals: SealSet::new(registry),
            vault,
            pending: IndexMap::new(),
            cancel,
        }
    }

    /// Scope for a one-off run outside the scheduler
    #[must_use]
    pub fn detached(vault: Vault) -> Self {
        Self::new(
            BranchId::new(),
            Arc::new(SealRegistry::new()),
            vault,
            CancellationToken::new(),
        )
    }

    /// Branch id
    #[must_use]
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// Cancellation token
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with `Cancelled` once cancellation was requested
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fired
    pub fn check_cancelled(&self) -> Result<(), ExecError> {
        if self.cancel.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Seals held
    #[must_use]
    pub fn seals(&self) -> &SealSet {
        &self.seals
    }

    /// Writes not yet published to the vault, in write order
    #[must_use]
    pub fn pending(&self) -> &IndexMap<String, Value> {
        &self.pending
    }

    /// Read a vault slot. The branch sees its own pending writes; otherwise
    /// reads do not take the seal but refuse a poisoned key.
    ///
    /// # Errors
    ///
    /// Returns `SealBreach` if the key's seal is poisoned
    pub async fn read_vault(&self, key: &str) -> Result<Option<Value>, ExecError> {
        if let Some(value) = self.pending.get(key) {
            return Ok(Some(*value));
        }
        if self.seals.registry().is_poisoned(key) {
            return Err(ExecError::SealBreach {
                key: key.to_string(),
            });
        }
        Ok(self.vault.read(key).await)
    }

    /// Stage a vault write under its seal, taking the seal on first write
    ///
    /// # Errors
    ///
    /// Returns `SealBreach` if the seal is poisoned, `Cancelled` if the
    /// branch is cancelled while waiting for it
    pub async fn write_vault(&mut self, key: &str, value: Value) -> Result<(), ExecError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(ExecError::Cancelled),
            acquired = self.seals.ensure(key) => acquired?,
        }
        self.pending.insert(key.to_string(), value);
        Ok(())
    }

    /// Publish pending writes, then release every seal without poisoning
    pub async fn release(&mut self) {
        for (key, value) in self.pending.drain(..) {
            self.vault.write(&key, value).await;
        }
        self.seals.release_all();
    }

    /// Drop pending writes, then poison and release every seal
    pub fn poison(&mut self) {
        self.pending.clear();
        self.seals.poison_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_takes_seal_until_release() {
        let registry = Arc::new(SealRegistry::new());
        let vault = Vault::new();
        let mut scope = BranchScope::new(
            BranchId::new(),
            Arc::clone(&registry),
            vault.clone(),
            CancellationToken::new(),
        );

        scope.write_vault("counter", Value::Int(3)).await.unwrap();
        assert!(scope.seals().holds("counter"));
        assert_eq!(scope.read_vault("counter").await.unwrap(), Some(Value::Int(3)));
        assert_eq!(vault.read("counter").await, None);

        scope.release().await;
        assert_eq!(vault.read("counter").await, Some(Value::Int(3)));
        registry.acquire("counter").await.unwrap().release();
    }

    #[tokio::test]
    async fn test_held_writes_invisible_to_other_branches() {
        let registry = Arc::new(SealRegistry::new());
        let vault = Vault::new();
        vault.write("k", Value::Int(1)).await;
        let mut writer = BranchScope::new(
            BranchId::new(),
            Arc::clone(&registry),
            vault.clone(),
            CancellationToken::new(),
        );
        let reader = BranchScope::new(
            BranchId::new(),
            Arc::clone(&registry),
            vault.clone(),
            CancellationToken::new(),
        );

        writer.write_vault("k", Value::Int(99)).await.unwrap();
        assert_eq!(writer.read_vault("k").await.unwrap(), Some(Value::Int(99)));
        assert_eq!(reader.read_vault("k").await.unwrap(), Some(Value::Int(1)));

        writer.poison();
        assert!(writer.pending().is_empty());
        assert_eq!(vault.read("k").await, Some(Value::Int(1)));
        assert!(matches!(
            reader.read_vault("k").await,
            Err(ExecError::SealBreach { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_refuses_poisoned_key() {
        let registry = Arc::new(SealRegistry::new());
        registry.acquire("counter").await.unwrap().poison();
        let scope = BranchScope::new(
            BranchId::new(),
            registry,
            Vault::new(),
            CancellationToken::new(),
        );
        assert!(matches!(
            scope.read_vault("counter").await,
            Err(ExecError::SealBreach { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_seal_wait() {
        let registry = Arc::new(SealRegistry::new());
        let held = registry.acquire("k").await.unwrap();
        let cancel = CancellationToken::new();
        let mut scope = BranchScope::new(
            BranchId::new(),
            Arc::clone(&registry),
            Vault::new(),
            cancel.clone(),
        );
        cancel.cancel();
        assert_eq!(
            scope.write_vault("k", Value::Int(1)).await,
            Err(ExecError::Cancelled)
        );
        held.release();
        assert!(!registry.is_poisoned("k"));
    }
}
