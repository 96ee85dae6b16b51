//! Rule-set scoped shared state.
//!
//! The vault itself does no exclusion; writers hold the key's seal.

use celarion_core::Value;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared key/value slots read and written by vault edges
#[derive(Debug, Clone, Default)]
pub struct Vault {
    slots: Arc<RwLock<IndexMap<String, Value>>>,
}

impl Vault {
    /// Create an empty vault
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a slot
    pub async fn read(&self, key: &str) -> Option<Value> {
        self.slots.read().await.get(key).copied()
    }

    /// Write a slot, returning the previous value
    pub async fn write(&self, key: &str, value: Value) -> Option<Value> {
        self.slots.write().await.insert(key.to_string(), value)
    }

    /// Copy of every slot in first-write order
    pub async fn snapshot(&self) -> IndexMap<String, Value> {
        self.slots.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vault_shared_between_clones() {
        let vault = Vault::new();
        let other = vault.clone();
        assert_eq!(vault.write("counter", Value::Int(1)).await, None);
        assert_eq!(other.read("counter").await, Some(Value::Int(1)));
        assert_eq!(other.write("counter", Value::Int(2)).await, Some(Value::Int(1)));
        assert_eq!(vault.snapshot().await.len(), 1);
    }
}
