//! Proof chain evaluation.

use crate::bindings::Bindings;
use crate::chain::{CompareOp, Operand, Predicate, ProofChain, ProofStep};
use crate::verdict::Verdict;
use celarion_core::{CoreError, Locator, Value};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Result of looking a locator up in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorLookup {
    /// Line present and valid
    Valid(Value),
    /// Line present but flushed
    Invalidated,
    /// No line for this locator
    Unknown,
}

/// Read-only view of the register-cache store
pub trait LocatorResolver {
    /// Look up a cache line
    fn lookup(&self, locator: &Locator) -> LocatorLookup;

    /// Current value of a register, dereferencing line references
    fn register(&self, name: &str) -> Option<Value>;
}

/// Resolver over an empty store
impl LocatorResolver for () {
    fn lookup(&self, _locator: &Locator) -> LocatorLookup {
        LocatorLookup::Unknown
    }

    fn register(&self, _name: &str) -> Option<Value> {
        None
    }
}

/// Proof evaluation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    /// A locator has no valid line yet; retry after the settle delay
    #[error("Unresolved locator @{locator} (invalidated: {invalidated})")]
    UnresolvedLocator {
        /// Locator that could not be read
        locator: Locator,
        /// True if the line exists but was flushed
        invalidated: bool,
    },

    /// Predicate nesting deeper than the engine allows
    #[error("Predicate nesting exceeds depth {0}")]
    TooDeep(usize),
}

impl From<ProofError> for CoreError {
    fn from(err: ProofError) -> Self {
        match err {
            ProofError::UnresolvedLocator { locator, .. } => CoreError::NotFound {
                kind: "locator".to_string(),
                id: locator.to_string(),
            },
            ProofError::TooDeep(_) => CoreError::Validation {
                field: "predicate".to_string(),
                reason: err.to_string(),
            },
        }
    }
}

/// Why a step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// Predicate did not hold
    Predicate,
    /// Range constraint violated
    RangeViolation,
}

/// Per-step result in a [`ProofTrace`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Held and carried validation
    Validated,
    /// Held without validation
    Passed,
    /// Did not hold
    Failed(FailReason),
    /// Not evaluated because an earlier step failed
    Skipped,
}

/// Verdict plus one outcome per chain step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofTrace {
    /// Overall verdict
    pub verdict: Verdict,
    /// Outcome of every step, in chain order
    pub steps: Vec<StepOutcome>,
}

impl ProofTrace {
    /// Index of the first failed step
    #[must_use]
    pub fn first_failure(&self) -> Option<(usize, FailReason)> {
        self.steps.iter().enumerate().find_map(|(i, s)| match s {
            StepOutcome::Failed(reason) => Some((i, *reason)),
            _ => None,
        })
    }
}

/// Evaluates proof chains
#[derive(Debug, Clone)]
pub struct ProofEngine {
    max_depth: usize,
}

impl ProofEngine {
    /// Default predicate nesting limit
    pub const DEFAULT_MAX_DEPTH: usize = 64;

    /// Create an engine with the default nesting limit
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_depth: Self::DEFAULT_MAX_DEPTH,
        }
    }

    /// Set the predicate nesting limit
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Evaluate a chain to a verdict
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedLocator` if a referenced line is not valid
    pub fn evaluate<R: LocatorResolver + ?Sized>(
        &self,
        chain: &ProofChain,
        bindings: &Bindings,
        resolver: &R,
    ) -> Result<Verdict, ProofError> {
        self.evaluate_traced(chain, bindings, resolver)
            .map(|t| t.verdict)
    }

    /// Evaluate a chain, recording every step's outcome
    ///
    /// Steps run left to right and stop at the first failure; later steps
    /// are recorded as skipped.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedLocator` if a referenced line is not valid
    pub fn evaluate_traced<R: LocatorResolver + ?Sized>(
        &self,
        chain: &ProofChain,
        bindings: &Bindings,
        resolver: &R,
    ) -> Result<ProofTrace, ProofError> {
        let mut steps = Vec::with_capacity(chain.len());
        let mut failed = false;
        let mut validated = false;

        for step in chain.steps() {
            if failed {
                steps.push(StepOutcome::Skipped);
                continue;
            }
            let outcome = self.evaluate_step(step, bindings, resolver)?;
            match outcome {
                StepOutcome::Failed(reason) => {
                    trace!(step = %step, ?reason, "proof step failed");
                    failed = true;
                }
                StepOutcome::Validated => validated = true,
                StepOutcome::Passed | StepOutcome::Skipped => {}
            }
            steps.push(outcome);
        }

        let verdict = if failed {
            Verdict::ErrFalse
        } else if validated {
            Verdict::Verified
        } else {
            Verdict::ShadowTrue
        };
        Ok(ProofTrace { verdict, steps })
    }

    fn evaluate_step<R: LocatorResolver + ?Sized>(
        &self,
        step: &ProofStep,
        bindings: &Bindings,
        resolver: &R,
    ) -> Result<StepOutcome, ProofError> {
        let ctx = Context {
            bindings,
            scope: step.scope.as_deref(),
            resolver,
            max_depth: self.max_depth,
        };

        if !ctx.predicate(&step.predicate, 0)? {
            return Ok(StepOutcome::Failed(FailReason::Predicate));
        }

        if let Some(rc) = &step.range {
            let in_range = ctx
                .operand(&rc.operand)?
                .and_then(|v| v.as_int())
                .is_some_and(|v| rc.range.contains(v));
            if !in_range {
                return Ok(StepOutcome::Failed(FailReason::RangeViolation));
            }
        }

        if let Some(locator) = &step.validate {
            resolve_line(resolver, locator)?;
        }

        Ok(if step.is_validating() {
            StepOutcome::Validated
        } else {
            StepOutcome::Passed
        })
    }
}

impl Default for ProofEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_line<R: LocatorResolver + ?Sized>(
    resolver: &R,
    locator: &Locator,
) -> Result<Value, ProofError> {
    match resolver.lookup(locator) {
        LocatorLookup::Valid(value) => Ok(value),
        LocatorLookup::Invalidated => Err(ProofError::UnresolvedLocator {
            locator: locator.clone(),
            invalidated: true,
        }),
        LocatorLookup::Unknown => Err(ProofError::UnresolvedLocator {
            locator: locator.clone(),
            invalidated: false,
        }),
    }
}

struct Context<'a, R: ?Sized> {
    bindings: &'a Bindings,
    scope: Option<&'a str>,
    resolver: &'a R,
    max_depth: usize,
}

impl<R: LocatorResolver + ?Sized> Context<'_, R> {
    fn operand(&self, operand: &Operand) -> Result<Option<Value>, ProofError> {
        Ok(match operand {
            Operand::Literal(v) => Some(*v),
            Operand::Binding(name) => self.bindings.get_scoped(self.scope, name).copied(),
            Operand::Locator(loc) => Some(resolve_line(self.resolver, loc)?),
            Operand::Register(name) => self.resolver.register(name),
        })
    }

    fn predicate(&self, predicate: &Predicate, depth: usize) -> Result<bool, ProofError> {
        if depth > self.max_depth {
            return Err(ProofError::TooDeep(self.max_depth));
        }
        match predicate {
            Predicate::Always => Ok(true),
            Predicate::Never => Ok(false),
            Predicate::Bound(name) => Ok(self
                .bindings
                .get_scoped(self.scope, name)
                .is_some_and(Value::truthy)),
            Predicate::Compare { left, op, right } => {
                let (Some(l), Some(r)) = (self.operand(left)?, self.operand(right)?) else {
                    return Ok(false);
                };
                Ok(compare(&l, *op, &r))
            }
            Predicate::Not(inner) => Ok(!self.predicate(inner, depth + 1)?),
            Predicate::All(inner) => {
                for p in inner {
                    if !self.predicate(p, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any(inner) => {
                for p in inner {
                    if self.predicate(p, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match (left.as_int(), right.as_int()) {
        (Some(l), Some(r)) => op.apply(l, r),
        _ => match (left, right, op) {
            (Value::Bool(l), Value::Bool(r), CompareOp::Eq) => l == r,
            (Value::Bool(l), Value::Bool(r), CompareOp::Ne) => l != r,
            // Mixed or ordered flags never hold
            _ => false,
        },
    }
}
