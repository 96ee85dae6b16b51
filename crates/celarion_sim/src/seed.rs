//! Seed management for reproducible simulations.

use celarion_core::Hash;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Simulation seed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimSeed {
    /// Base seed value
    pub seed: u64,
    /// Namespace for derived seeds
    #[serde(default)]
    pub namespace: String,
}

impl SimSeed {
    /// Seed from a literal value
    #[must_use]
    pub fn from_literal(seed: u64) -> Self {
        Self {
            seed,
            namespace: String::new(),
        }
    }

    /// Seed from a string, hashed
    #[must_use]
    pub fn from_string(s: &str) -> Self {
        Self::from_literal(Self::fold(&Hash::compute(s.as_bytes())))
    }

    /// Set namespace
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Derive an independent seed for `context`
    #[must_use]
    pub fn derive(&self, context: &str) -> Self {
        let mut input = self.seed.to_le_bytes().to_vec();
        input.extend_from_slice(self.namespace.as_bytes());
        input.push(0);
        input.extend_from_slice(context.as_bytes());
        Self {
            seed: Self::fold(&Hash::compute(&input)),
            namespace: self.namespace.clone(),
        }
    }

    /// RNG for this seed
    #[must_use]
    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }

    fn fold(hash: &Hash) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

impl Default for SimSeed {
    fn default() -> Self {
        Self::from_literal(42)
    }
}

impl std::fmt::Display for SimSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.seed)
        } else {
            write!(f, "{}/{}", self.namespace, self.seed)
        }
    }
}
