//! Branch scheduler.
//!
//! Each fired directive runs as its own tokio task with its own scope.
//! The scheduler tracks branch status, fans cancellation out through
//! child tokens, and decides whether a finished branch releases or
//! poisons the seals it holds.

use crate::config::SchedulerConfig;
use crate::engine::{ExecutionResult, StackEngine};
use crate::error::ExecError;
use crate::scope::BranchScope;
use crate::seal::SealRegistry;
use celarion_core::{BranchId, DirectiveId, NodeId};
use celarion_graph::StreamGraph;
use celarion_proof::{Bindings, ProofChain};
use celarion_rules::{Directive, RuleError, RuleSet, Vault};
use futures::FutureExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// One unit of scheduled work: a condition gate and a body to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleBranch {
    /// Branch id
    pub id: BranchId,
    /// Directive the branch was fired from, if any
    pub directive: Option<DirectiveId>,
    /// Gate evaluated before the body runs
    pub condition: ProofChain,
    /// Entry nodes, run in order
    pub body: Vec<NodeId>,
    /// Initial bindings
    pub bindings: Bindings,
}

impl RuleBranch {
    /// Create an ungated branch
    #[must_use]
    pub fn new(body: Vec<NodeId>) -> Self {
        Self {
            id: BranchId::new(),
            directive: None,
            condition: ProofChain::new(),
            body,
            bindings: Bindings::new(),
        }
    }

    /// Set the gate
    #[must_use]
    pub fn with_condition(mut self, condition: ProofChain) -> Self {
        self.condition = condition;
        self
    }

    /// Set the initial bindings
    #[must_use]
    pub fn with_bindings(mut self, bindings: Bindings) -> Self {
        self.bindings = bindings;
        self
    }

    /// Build a branch for a directive, gated by its inherited condition
    ///
    /// # Errors
    ///
    /// Returns the rule error if the inheritance lineage is broken
    pub fn from_directive(
        rules: &RuleSet,
        directive: &Directive,
        bindings: Bindings,
    ) -> Result<Self, RuleError> {
        Ok(Self {
            id: BranchId::new(),
            directive: Some(directive.id.clone()),
            condition: rules.effective_condition(&directive.id)?,
            body: directive.body.clone(),
            bindings,
        })
    }
}

/// Lifecycle of a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    /// Spawned and not finished
    Running,
    /// Body reached its terminals
    Completed,
    /// Ended with an error
    Failed(String),
    /// Cancelled before finishing
    Cancelled,
    /// The gate did not hold
    NotFired,
}

impl BranchStatus {
    /// True once the branch can no longer change state
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Final report for a joined branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchReport {
    /// Branch id
    pub id: BranchId,
    /// Source directive
    pub directive: Option<DirectiveId>,
    /// Final status
    pub status: BranchStatus,
    /// Result when the body completed
    pub result: Option<ExecutionResult>,
    /// Error when the branch failed
    pub error: Option<ExecError>,
}

#[derive(Debug)]
struct BranchEntry {
    status: BranchStatus,
    cancel: CancellationToken,
    handle: Option<JoinHandle<BranchReport>>,
}

/// Runs rule branches as supervised tasks
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    engine: Arc<StackEngine>,
    seals: Arc<SealRegistry>,
    gate: Option<Arc<Semaphore>>,
    root: CancellationToken,
    branches: Arc<RwLock<IndexMap<BranchId, BranchEntry>>>,
}

impl Scheduler {
    /// Create a scheduler over `engine`
    #[must_use]
    pub fn new(config: SchedulerConfig, engine: Arc<StackEngine>) -> Self {
        let gate = if config.parallel {
            None
        } else {
            Some(Arc::new(Semaphore::new(1)))
        };
        Self {
            config,
            engine,
            seals: Arc::new(SealRegistry::new()),
            gate,
            root: CancellationToken::new(),
            branches: Arc::new(RwLock::new(IndexMap::new())),
        }
    }

    /// Get configuration
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Seal registry shared by every branch
    #[must_use]
    pub fn seals(&self) -> &Arc<SealRegistry> {
        &self.seals
    }

    /// Engine handle
    #[must_use]
    pub fn engine(&self) -> &Arc<StackEngine> {
        &self.engine
    }

    /// Spawn a branch
    #[instrument(skip_all, fields(branch = %branch.id))]
    pub async fn spawn(&self, branch: RuleBranch, graph: Arc<StreamGraph>, vault: Vault) -> BranchId {
        let id = branch.id;
        let cancel = self.root.child_token();
        let mut scope = BranchScope::new(id, Arc::clone(&self.seals), vault, cancel.clone());
        let engine = Arc::clone(&self.engine);
        let gate = self.gate.clone();
        let branches = Arc::clone(&self.branches);

        // Register before spawning so the task's final update always finds its entry.
        let mut table = self.branches.write().await;
        let handle = tokio::spawn(async move {
            let _permit = match gate {
                Some(gate) => {
                    let acquired = tokio::select! {
                        biased;
                        () = scope.cancel_token().cancelled() => Err(ExecError::Cancelled),
                        permit = gate.acquire_owned() => permit
                            .map_err(|_| ExecError::Internal("scheduler gate closed".to_string())),
                    };
                    match acquired {
                        Ok(permit) => Some(permit),
                        Err(err) => {
                            let report = finish(&branch, None, Err(err)).await;
                            record(&branches, &report).await;
                            return report;
                        }
                    }
                }
                None => None,
            };

            let outcome = run_branch(&engine, &graph, &branch, &mut scope).await;
            let report = finish(&branch, Some(&mut scope), outcome).await;
            record(&branches, &report).await;
            report
        });
        table.insert(
            id,
            BranchEntry {
                status: BranchStatus::Running,
                cancel,
                handle: Some(handle),
            },
        );
        debug!("branch spawned");
        id
    }

    /// Spawn one branch per active directive
    ///
    /// # Errors
    ///
    /// Returns the rule error of the first directive whose lineage is broken;
    /// nothing is spawned in that case
    pub async fn spawn_directives(
        &self,
        rules: &RuleSet,
        bindings: &Bindings,
    ) -> Result<Vec<BranchId>, ExecError> {
        let branches = rules
            .active()
            .map(|d| RuleBranch::from_directive(rules, d, bindings.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut ids = Vec::with_capacity(branches.len());
        for branch in branches {
            ids.push(
                self.spawn(branch, Arc::clone(rules.graph()), rules.vault().clone())
                    .await,
            );
        }
        info!(count = ids.len(), version = %rules.version(), "directives spawned");
        Ok(ids)
    }

    /// Request cancellation of one branch
    pub async fn cancel(&self, id: BranchId) -> bool {
        match self.branches.read().await.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Request cancellation of every branch
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// Status of one branch
    pub async fn status(&self, id: BranchId) -> Option<BranchStatus> {
        self.branches.read().await.get(&id).map(|e| e.status.clone())
    }

    /// Status of every branch, in spawn order
    pub async fn statuses(&self) -> Vec<(BranchId, BranchStatus)> {
        self.branches
            .read()
            .await
            .iter()
            .map(|(id, e)| (*id, e.status.clone()))
            .collect()
    }

    /// Wait for every spawned branch not yet joined. Joined branches leave
    /// the status table; their reports carry the final status.
    pub async fn join_all(&self) -> Vec<BranchReport> {
        let pending: Vec<(BranchId, JoinHandle<BranchReport>)> = {
            let mut table = self.branches.write().await;
            table
                .iter_mut()
                .filter_map(|(id, e)| e.handle.take().map(|h| (*id, h)))
                .collect()
        };

        let (ids, handles): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;

        let mut reports = Vec::with_capacity(joined.len());
        for (id, outcome) in ids.into_iter().zip(joined) {
            match outcome {
                Ok(report) => reports.push(report),
                Err(join_err) => {
                    error!(branch = %id, %join_err, "branch task aborted");
                    let report = BranchReport {
                        id,
                        directive: None,
                        status: BranchStatus::Failed(join_err.to_string()),
                        result: None,
                        error: Some(ExecError::Internal(join_err.to_string())),
                    };
                    reports.push(report);
                }
            }
        }

        let mut table = self.branches.write().await;
        for report in &reports {
            table.shift_remove(&report.id);
        }
        reports
    }
}

async fn run_branch(
    engine: &StackEngine,
    graph: &StreamGraph,
    branch: &RuleBranch,
    scope: &mut BranchScope,
) -> Result<Option<ExecutionResult>, ExecError> {
    let verdict = engine.evaluate(&branch.condition, &branch.bindings).await?;
    if !verdict.holds() {
        debug!(branch = %branch.id, %verdict, "condition did not hold");
        return Ok(None);
    }

    let run = engine.run_sequence(graph, &branch.body, branch.bindings.clone(), scope);
    match AssertUnwindSafe(run).catch_unwind().await {
        Ok(outcome) => outcome.map(Some),
        Err(panic) => Err(ExecError::Panicked(panic_message(panic.as_ref()))),
    }
}

async fn finish(
    branch: &RuleBranch,
    scope: Option<&mut BranchScope>,
    outcome: Result<Option<ExecutionResult>, ExecError>,
) -> BranchReport {
    let (status, result, error) = match outcome {
        Ok(Some(result)) => (BranchStatus::Completed, Some(result), None),
        Ok(None) => (BranchStatus::NotFired, None, None),
        Err(ExecError::Cancelled) => (BranchStatus::Cancelled, None, Some(ExecError::Cancelled)),
        Err(err) => (BranchStatus::Failed(err.to_string()), None, Some(err)),
    };

    if let Some(scope) = scope {
        match &error {
            Some(err) if err.is_fatal() => {
                warn!(branch = %branch.id, %err, "fatal branch error, poisoning seals");
                scope.poison();
            }
            _ => scope.release().await,
        }
    }

    BranchReport {
        id: branch.id,
        directive: branch.directive.clone(),
        status,
        result,
        error,
    }
}

async fn record(branches: &RwLock<IndexMap<BranchId, BranchEntry>>, report: &BranchReport) {
    if let Some(entry) = branches.write().await.get_mut(&report.id) {
        entry.status = report.status.clone();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
