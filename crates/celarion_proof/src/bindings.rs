//! Named bindings visible to predicates and node actions.

use celarion_core::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered binding environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bindings {
    values: IndexMap<String, Value>,
}

impl Bindings {
    /// Create an empty environment
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a binding, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Look up a binding by its exact name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Look up `scope.name` first, then `name`
    #[must_use]
    pub fn get_scoped(&self, scope: Option<&str>, name: &str) -> Option<&Value> {
        if let Some(scope) = scope {
            let qualified = format!("{}.{}", scope, name);
            if let Some(value) = self.values.get(&qualified) {
                return Some(value);
            }
        }
        self.values.get(name)
    }

    /// Remove a binding
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.shift_remove(name)
    }

    /// Copy every binding from `other`, overwriting on collision
    pub fn extend_from(&mut self, other: &Bindings) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), *value);
        }
    }

    /// Copy the named bindings from `other`; names absent there are skipped
    pub fn extend_selected(&mut self, other: &Bindings, names: &[String]) {
        for name in names {
            if let Some(value) = other.values.get(name) {
                self.values.insert(name.clone(), *value);
            }
        }
    }

    /// Number of bindings
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no bindings are set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

impl FromIterator<(String, Value)> for Bindings {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_lookup_prefers_qualified() {
        let b = Bindings::new().with("count", 1).with("loop.count", 7);
        assert_eq!(b.get_scoped(Some("loop"), "count"), Some(&Value::Int(7)));
        assert_eq!(b.get_scoped(Some("other"), "count"), Some(&Value::Int(1)));
        assert_eq!(b.get_scoped(None, "count"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_extend_selected() {
        let source = Bindings::new().with("a", 1).with("b", 2);
        let mut target = Bindings::new();
        target.extend_selected(&source, &["b".to_string(), "missing".to_string()]);
        assert_eq!(target.len(), 1);
        assert_eq!(target.get("b"), Some(&Value::Int(2)));
    }
}
