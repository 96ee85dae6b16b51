//! Proof chains: ordered predicate steps with optional validation.

use celarion_core::{Locator, Value, ValueRange};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    /// Apply to two integers
    #[must_use]
    pub const fn apply(&self, left: i64, right: i64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
        }
    }

    /// Operator symbol
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Something a predicate can read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Constant value
    Literal(Value),
    /// Binding name, resolved through the step's scope
    Binding(String),
    /// Cache line, read through the store
    Locator(Locator),
    /// Register, read through the store
    Register(String),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{}", v),
            Self::Binding(name) => f.write_str(name),
            Self::Locator(loc) => write!(f, "@{}", loc),
            Self::Register(name) => write!(f, "${}", name),
        }
    }
}

/// A predicate over bindings and store contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Always holds
    Always,
    /// Never holds
    Never,
    /// Compare two operands
    Compare {
        /// Left operand
        left: Operand,
        /// Operator
        op: CompareOp,
        /// Right operand
        right: Operand,
    },
    /// Binding is present and truthy
    Bound(String),
    /// Negation
    Not(Box<Predicate>),
    /// Every inner predicate holds
    All(Vec<Predicate>),
    /// At least one inner predicate holds
    Any(Vec<Predicate>),
}

impl Predicate {
    /// Shorthand for [`Predicate::Compare`]
    #[must_use]
    pub fn compare(left: Operand, op: CompareOp, right: Operand) -> Self {
        Self::Compare { left, op, right }
    }

    /// Shorthand for `binding <op> literal`
    #[must_use]
    pub fn binding_cmp(name: &str, op: CompareOp, literal: i64) -> Self {
        Self::compare(
            Operand::Binding(name.to_string()),
            op,
            Operand::Literal(Value::Int(literal)),
        )
    }

    /// Shorthand for [`Predicate::Not`]
    #[must_use]
    pub fn negate(inner: Predicate) -> Self {
        Self::Not(Box::new(inner))
    }

    fn collect_locators<'a>(&'a self, out: &mut Vec<&'a Locator>) {
        match self {
            Self::Always | Self::Never | Self::Bound(_) => {}
            Self::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Locator(loc) = operand {
                        out.push(loc);
                    }
                }
            }
            Self::Not(inner) => inner.collect_locators(out),
            Self::All(inner) | Self::Any(inner) => {
                for p in inner {
                    p.collect_locators(out);
                }
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("always"),
            Self::Never => f.write_str("never"),
            Self::Compare { left, op, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Self::Bound(name) => write!(f, "bound({})", name),
            Self::Not(inner) => write!(f, "not({})", inner),
            Self::All(inner) | Self::Any(inner) => {
                let word = if matches!(self, Self::All(_)) { "all" } else { "any" };
                write!(f, "{}(", word)?;
                for (i, p) in inner.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Numeric range an operand must fall within
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConstraint {
    /// Operand to check
    pub operand: Operand,
    /// Allowed range
    pub range: ValueRange,
}

/// One step of a proof chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Predicate that must hold
    pub predicate: Predicate,
    /// Binding namespace tried before the bare name
    #[serde(default)]
    pub scope: Option<String>,
    /// Range the step validates
    #[serde(default)]
    pub range: Option<RangeConstraint>,
    /// Locator the step validates
    #[serde(default)]
    pub validate: Option<Locator>,
}

impl ProofStep {
    /// Create an unvalidated step
    #[must_use]
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            scope: None,
            range: None,
            validate: None,
        }
    }

    /// Set the scope qualifier
    #[must_use]
    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Require `operand` to fall in `range`
    #[must_use]
    pub fn in_range(mut self, operand: Operand, range: ValueRange) -> Self {
        self.range = Some(RangeConstraint { operand, range });
        self
    }

    /// Require `locator` to resolve to a valid line
    #[must_use]
    pub fn validating(mut self, locator: Locator) -> Self {
        self.validate = Some(locator);
        self
    }

    /// True if the step carries range or locator validation
    #[must_use]
    pub fn is_validating(&self) -> bool {
        self.range.is_some() || self.validate.is_some()
    }
}

impl fmt::Display for ProofStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proof({})", self.predicate)?;
        if let Some(scope) = &self.scope {
            write!(f, "::when({})", scope)?;
        }
        if let Some(rc) = &self.range {
            write!(f, "::range({}{})", rc.operand, rc.range)?;
        }
        if let Some(loc) = &self.validate {
            write!(f, "::validate::@{}", loc)?;
        }
        Ok(())
    }
}

/// Ordered sequence of proof steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofChain {
    steps: Vec<ProofStep>,
}

impl ProofChain {
    /// Create an empty chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from steps
    #[must_use]
    pub fn from_steps(steps: Vec<ProofStep>) -> Self {
        Self { steps }
    }

    /// Append a step
    #[must_use]
    pub fn with_step(mut self, step: ProofStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Steps in evaluation order
    #[must_use]
    pub fn steps(&self) -> &[ProofStep] {
        &self.steps
    }

    /// Number of steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True for the zero-step chain
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Distinct locators referenced anywhere in the chain, first use first
    #[must_use]
    pub fn locators(&self) -> Vec<Locator> {
        let mut found = Vec::new();
        for step in &self.steps {
            step.predicate.collect_locators(&mut found);
            if let Some(RangeConstraint {
                operand: Operand::Locator(loc),
                ..
            }) = &step.range
            {
                found.push(loc);
            }
            if let Some(loc) = &step.validate {
                found.push(loc);
            }
        }
        let mut out: Vec<Locator> = Vec::with_capacity(found.len());
        for loc in found {
            if !out.contains(loc) {
                out.push(loc.clone());
            }
        }
        out
    }

    /// This chain's steps followed by `child`'s
    #[must_use]
    pub fn extended_by(&self, child: &ProofChain) -> ProofChain {
        let mut steps = self.steps.clone();
        steps.extend(child.steps.iter().cloned());
        Self { steps }
    }
}

impl fmt::Display for ProofChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("proof()");
        }
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(" >> ")?;
            }
            write!(f, "{}", step)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(name: &str) -> Locator {
        Locator::new(name).unwrap()
    }

    #[test]
    fn test_locators_deduplicated_in_order() {
        let chain = ProofChain::new()
            .with_step(
                ProofStep::new(Predicate::compare(
                    Operand::Locator(loc("ufo")),
                    CompareOp::Gt,
                    Operand::Literal(Value::Int(0)),
                ))
                .validating(loc("core")),
            )
            .with_step(ProofStep::new(Predicate::Always).validating(loc("ufo")));

        assert_eq!(chain.locators(), vec![loc("ufo"), loc("core")]);
    }

    #[test]
    fn test_extended_by_prepends_parent() {
        let parent = ProofChain::new().with_step(ProofStep::new(Predicate::Bound("a".into())));
        let child = ProofChain::new().with_step(ProofStep::new(Predicate::Never));
        let effective = parent.extended_by(&child);
        assert_eq!(effective.len(), 2);
        assert_eq!(effective.steps()[0].predicate, Predicate::Bound("a".into()));
        assert_eq!(effective.steps()[1].predicate, Predicate::Never);
    }

    #[test]
    fn test_step_display() {
        let step = ProofStep::new(Predicate::binding_cmp("x", CompareOp::Ge, 5))
            .scoped("loop")
            .in_range(
                Operand::Binding("x".into()),
                ValueRange::new(5, 25).unwrap(),
            )
            .validating(loc("core"));
        assert_eq!(
            step.to_string(),
            "proof(x >= 5)::when(loop)::range(x[5::25])::validate::@core"
        );
        assert!(step.is_validating());
    }

    #[test]
    fn test_chain_json_roundtrip() {
        let chain = ProofChain::new().with_step(ProofStep::new(Predicate::All(vec![
            Predicate::Always,
            Predicate::negate(Predicate::Bound("halt".into())),
        ])));
        let json = serde_json::to_string(&chain).unwrap();
        let back: ProofChain = serde_json::from_str(&json).unwrap();
        assert_eq!(chain, back);
    }
}
