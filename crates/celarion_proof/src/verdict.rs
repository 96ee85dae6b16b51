//! Tri-state proof verdict.

use serde::{Deserialize, Serialize};

/// Outcome of evaluating a proof chain.
///
/// Variants are declared in lattice order so the derived `Ord` is the
/// lattice order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// A predicate failed or a range was violated
    ErrFalse,
    /// Every step held, none carried validation
    ShadowTrue,
    /// Every step held and at least one was validated
    Verified,
}

impl Verdict {
    /// Conjunction: the lower of the two
    #[must_use]
    pub fn meet(self, other: Self) -> Self {
        self.min(other)
    }

    /// Disjunction: the higher of the two
    #[must_use]
    pub fn join(self, other: Self) -> Self {
        self.max(other)
    }

    /// Meet over an iterator; the empty meet is `Verified`
    #[must_use]
    pub fn meet_all(verdicts: impl IntoIterator<Item = Self>) -> Self {
        verdicts.into_iter().fold(Self::Verified, Self::meet)
    }

    /// True for `shadow_true` and `verified`
    #[must_use]
    pub const fn holds(&self) -> bool {
        !matches!(self, Self::ErrFalse)
    }

    /// Wire name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ErrFalse => "err_false",
            Self::ShadowTrue => "shadow_true",
            Self::Verified => "verified",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn verdict() -> impl Strategy<Value = Verdict> {
        prop_oneof![
            Just(Verdict::ErrFalse),
            Just(Verdict::ShadowTrue),
            Just(Verdict::Verified),
        ]
    }

    #[test]
    fn test_lattice_order() {
        assert!(Verdict::ErrFalse < Verdict::ShadowTrue);
        assert!(Verdict::ShadowTrue < Verdict::Verified);
        assert_eq!(Verdict::Verified.meet(Verdict::ShadowTrue), Verdict::ShadowTrue);
        assert_eq!(Verdict::meet_all([]), Verdict::Verified);
        assert!(!Verdict::ErrFalse.holds());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Verdict::ShadowTrue).unwrap();
        assert_eq!(json, "\"shadow_true\"");
    }

    proptest! {
        #[test]
        fn prop_meet_is_commutative(a in verdict(), b in verdict()) {
            prop_assert_eq!(a.meet(b), b.meet(a));
        }

        #[test]
        fn prop_meet_is_associative(a in verdict(), b in verdict(), c in verdict()) {
            prop_assert_eq!(a.meet(b).meet(c), a.meet(b.meet(c)));
        }

        #[test]
        fn prop_meet_is_lower_bound(a in verdict(), b in verdict()) {
            let m = a.meet(b);
            prop_assert!(m <= a && m <= b);
            prop_assert_eq!(a.meet(a), a);
        }
    }
}
