//! The stack engine.
//!
//! Executes the stream graph with an explicit frame stack instead of
//! recursion, so cycles only cost visit counts. Each top-level invocation
//! resets the per-node visit counters.

use crate::config::EngineConfig;
use crate::error::ExecError;
use crate::scope::BranchScope;
use celarion_cache::{RegisterCacheStore, RegisterValue};
use celarion_core::{Locator, NodeId, Value};
use celarion_graph::{Action, EdgeKind, StreamGraph, VaultOp};
use celarion_proof::{Bindings, Operand, ProofChain, ProofEngine, ProofError, Verdict};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Bindings when the last segment reached its terminal
    pub bindings: Bindings,
    /// Every node dispatched, in order
    pub trace: Vec<NodeId>,
    /// Terminal reached by each segment
    pub terminals: Vec<NodeId>,
}

#[derive(Debug)]
struct Frame {
    node: NodeId,
    bindings: Bindings,
    segment_start: bool,
}

/// Executes stream graphs against the register-cache store
#[derive(Debug, Clone)]
pub struct StackEngine {
    config: EngineConfig,
    proof: ProofEngine,
    store: Arc<RegisterCacheStore>,
}

impl StackEngine {
    /// Create an engine over `store`
    #[must_use]
    pub fn new(config: EngineConfig, store: Arc<RegisterCacheStore>) -> Self {
        Self {
            config,
            proof: ProofEngine::new(),
            store,
        }
    }

    /// Get configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store handle
    #[must_use]
    pub fn store(&self) -> &Arc<RegisterCacheStore> {
        &self.store
    }

    /// Run from a single entry until a terminal node
    ///
    /// # Errors
    ///
    /// Returns the error that ended the branch
    pub async fn run(
        &self,
        graph: &StreamGraph,
        entry: NodeId,
        bindings: Bindings,
        scope: &mut BranchScope,
    ) -> Result<ExecutionResult, ExecError> {
        self.run_sequence(graph, &[entry], bindings, scope).await
    }

    /// Run a directive body: each entry runs to a terminal in order, and
    /// bindings carry from one segment into the next. Each segment is its
    /// own invocation for the iteration ceiling.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the branch
    #[instrument(skip_all, fields(branch = %scope.branch(), entries = entries.len()))]
    pub async fn run_sequence(
        &self,
        graph: &StreamGraph,
        entries: &[NodeId],
        bindings: Bindings,
        scope: &mut BranchScope,
    ) -> Result<ExecutionResult, ExecError> {
        for entry in entries {
            graph.validate_entry(*entry)?;
        }

        let mut stack: Vec<Frame> = entries
            .iter()
            .rev()
            .map(|&node| Frame {
                node,
                bindings: Bindings::new(),
                segment_start: true,
            })
            .collect();
        let mut carry = bindings;
        let mut visits: HashMap<NodeId, u32> = HashMap::new();
        let mut inbox: IndexMap<NodeId, Bindings> = IndexMap::new();
        let mut trace = Vec::new();
        let mut terminals = Vec::new();

        while let Some(mut frame) = stack.pop() {
            scope.check_cancelled()?;

            if frame.segment_start {
                visits.clear();
                let mut start = carry.clone();
                start.extend_from(&frame.bindings);
                frame.bindings = start;
            }

            let visited = visits.entry(frame.node).or_insert(0);
            *visited += 1;
            if *visited > self.config.max_iterations {
                warn!(node = %frame.node, limit = self.config.max_iterations, "iteration limit exceeded");
                return Err(ExecError::IterationLimitExceeded {
                    node: frame.node,
                    limit: self.config.max_iterations,
                });
            }
            trace.push(frame.node);

            if let Some(pending) = inbox.shift_remove(&frame.node) {
                frame.bindings.extend_from(&pending);
            }

            let node = graph.node(frame.node)?;
            trace!(node = %frame.node, kind = ?node.kind, "dispatch");

            for action in &node.actions {
                self.apply_action(action, &mut frame.bindings).await?;
            }

            self.run_side_edges(graph, frame.node, &mut frame.bindings, &mut inbox, scope)
                .await?;

            if node.is_terminal() {
                terminals.push(frame.node);
                carry = frame.bindings;
                continue;
            }

            let next = self.select(graph, frame.node, &frame.bindings).await?;
            stack.push(Frame {
                node: next,
                bindings: frame.bindings,
                segment_start: false,
            });
        }

        debug!(steps = trace.len(), "run complete");
        Ok(ExecutionResult {
            bindings: carry,
            trace,
            terminals,
        })
    }

    /// Evaluate a condition, prefetching unresolved locators between retries
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedLocator` once retries are exhausted
    pub async fn evaluate(
        &self,
        chain: &ProofChain,
        bindings: &Bindings,
    ) -> Result<Verdict, ExecError> {
        let mut attempt = 0;
        loop {
            match self.proof.evaluate(chain, bindings, self.store.as_ref()) {
                Ok(verdict) => return Ok(verdict),
                Err(ProofError::UnresolvedLocator { locator, .. })
                    if attempt < self.config.locator_retries =>
                {
                    attempt += 1;
                    debug!(%locator, attempt, "guard locator unresolved, prefetching");
                    if self.prefetch_once(&locator).await.is_err() {
                        tokio::time::sleep(self.config.settle_delay()).await;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn select(
        &self,
        graph: &StreamGraph,
        node: NodeId,
        bindings: &Bindings,
    ) -> Result<NodeId, ExecError> {
        let mut fallback = None;
        for edge in graph.trigger_edges(node) {
            if edge.fallback {
                fallback.get_or_insert(edge.to);
                continue;
            }
            let verdict = match &edge.guard {
                Some(guard) => self.evaluate(guard, bindings).await?,
                None => Verdict::ShadowTrue,
            };
            if verdict.holds() {
                trace!(from = %node, to = %edge.to, %verdict, "trigger edge taken");
                return Ok(edge.to);
            }
        }
        match fallback {
            Some(target) => {
                trace!(from = %node, to = %target, "fallback edge taken");
                Ok(target)
            }
            None => Err(ExecError::NoViableBranch { node }),
        }
    }

    async fn run_side_edges(
        &self,
        graph: &StreamGraph,
        node: NodeId,
        bindings: &mut Bindings,
        inbox: &mut IndexMap<NodeId, Bindings>,
        scope: &mut BranchScope,
    ) -> Result<(), ExecError> {
        let edges: Vec<_> = graph
            .outgoing(node)
            .filter(|e| e.kind != EdgeKind::Trigger)
            .collect();

        for edge in edges {
            match edge.kind {
                EdgeKind::Vault => {
                    let target = graph.node(edge.to)?;
                    let Some(key) = target.vault_key() else {
                        return Err(ExecError::Internal(format!(
                            "vault edge into non-vault {}",
                            edge.to
                        )));
                    };
                    match &edge.vault {
                        Some(VaultOp::ReadInto(name)) => {
                            if let Some(value) = scope.read_vault(key).await? {
                                bindings.set(name.clone(), value);
                            }
                        }
                        Some(VaultOp::Write(operand)) => {
                            let value = self.resolve(operand, bindings).await?;
                            scope.write_vault(key, value).await?;
                        }
                        None => {}
                    }
                }
                EdgeKind::Tracker => {
                    let target = inbox.entry(edge.to).or_default();
                    if edge.forward.is_empty() {
                        target.extend_from(bindings);
                    } else {
                        target.extend_selected(bindings, &edge.forward);
                    }
                }
                EdgeKind::Trigger => {}
            }
        }
        Ok(())
    }

    async fn apply_action(&self, action: &Action, bindings: &mut Bindings) -> Result<(), ExecError> {
        match action {
            Action::Set { name, value } => {
                let value = self.resolve(value, bindings).await?;
                bindings.set(name.clone(), value);
            }
            Action::Add { name, delta } => {
                let current = bindings.get(name).copied().unwrap_or(Value::Int(0));
                bindings.set(name.clone(), current.checked_add(*delta)?);
            }
            Action::Store { register, value } => {
                let contents = match value {
                    Operand::Locator(locator) => RegisterValue::Line(locator.clone()),
                    other => RegisterValue::Scalar(self.resolve(other, bindings).await?),
                };
                self.store.set_register(register, contents)?;
            }
            Action::Load { register, into } => {
                let value = self
                    .store
                    .register_value(register)?
                    .ok_or_else(|| ExecError::EmptyRegister(register.clone()))?;
                bindings.set(into.clone(), value);
            }
            Action::WriteLine { locator, value } => {
                let value = self.resolve(value, bindings).await?;
                self.store.write_line(locator.clone(), value)?;
            }
            Action::Prefetch(locator) => {
                self.prefetch(locator).await?;
            }
            Action::Flush(locator) => {
                self.store.flush(locator)?;
            }
        }
        Ok(())
    }

    async fn resolve(&self, operand: &Operand, bindings: &Bindings) -> Result<Value, ExecError> {
        match operand {
            Operand::Literal(value) => Ok(*value),
            Operand::Binding(name) => bindings
                .get(name)
                .copied()
                .ok_or_else(|| ExecError::Unbound(name.clone())),
            Operand::Register(name) => self
                .store
                .register_value(name)?
                .ok_or_else(|| ExecError::EmptyRegister(name.clone())),
            Operand::Locator(locator) => self.prefetch(locator).await,
        }
    }

    async fn prefetch_once(&self, locator: &Locator) -> Result<Value, ExecError> {
        match tokio::time::timeout(self.config.locator_deadline(), self.store.prefetch(locator))
            .await
        {
            Ok(Ok(line)) => Ok(line.value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ExecError::UnresolvedLocator {
                locator: locator.clone(),
            }),
        }
    }

    /// Prefetch a locator with bounded retries after the settle delay
    async fn prefetch(&self, locator: &Locator) -> Result<Value, ExecError> {
        let mut attempt = 0;
        loop {
            match self.prefetch_once(locator).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.config.locator_retries => {
                    debug!(%locator, %err, "prefetch retries exhausted");
                    return Err(ExecError::UnresolvedLocator {
                        locator: locator.clone(),
                    });
                }
                Err(_) => {
                    attempt += 1;
                    tokio::time::sleep(self.config.settle_delay()).await;
                }
            }
        }
    }
}
