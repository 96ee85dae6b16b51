//! Guild member control surface.
//!
//! A node holds one replica per attached guild plus the scheduler that runs
//! directive branches against the committed rule sets.

use crate::config::NodeConfig;
use crate::coordinator::GuildCoordinator;
use crate::error::GuildError;
use crate::membership::{Guild, GuildMember};
use crate::sync::GuildSync;
use crate::transport::PeerTransport;
use celarion_cache::RegisterCacheStore;
use celarion_core::{BranchId, EditId, GuildName, RuleVersion};
use celarion_graph::StreamGraph;
use celarion_proof::{Bindings, Confidence, ConfidenceScorer, ProofEngine, StepRatioScorer};
use celarion_rules::RuleEdit;
use celarion_runtime::{BranchReport, RuleBranch, Scheduler, StackEngine};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One guild member with its replicas and branch scheduler
pub struct GuildNode {
    config: NodeConfig,
    graph: Arc<StreamGraph>,
    store: Arc<RegisterCacheStore>,
    replicas: IndexMap<GuildName, Arc<Mutex<GuildSync>>>,
    scheduler: Scheduler,
    proof: ProofEngine,
    scorer: Box<dyn ConfidenceScorer>,
}

impl std::fmt::Debug for GuildNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildNode")
            .field("member", &self.config.member)
            .field("guilds", &self.replicas.keys().collect::<Vec<_>>())
            .field("parallel", &self.config.parallel)
            .finish_non_exhaustive()
    }
}

impl GuildNode {
    /// Initialize a member and attach every guild named in `config`
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid, or `NotMember`
    /// if the member is missing from an attached roster
    pub fn new(
        config: NodeConfig,
        graph: Arc<StreamGraph>,
        store: Arc<RegisterCacheStore>,
    ) -> Result<Self, GuildError> {
        config.validate()?;
        let scheduler_config = config.scheduler();
        let engine = Arc::new(StackEngine::new(
            scheduler_config.engine.clone(),
            Arc::clone(&store),
        ));
        let mut node = Self {
            graph,
            store,
            replicas: IndexMap::new(),
            scheduler: Scheduler::new(scheduler_config, engine),
            proof: ProofEngine::new(),
            scorer: Box::new(StepRatioScorer),
            config: config.clone(),
        };
        for guild in config.guilds {
            node.attach(Guild::from(guild))?;
        }
        info!(member = %node.config.member, guilds = node.replicas.len(), parallel = node.config.parallel, "node initialized");
        Ok(node)
    }

    /// Replace the confidence scorer used by [`GuildNode::submit`]
    #[must_use]
    pub fn with_scorer(mut self, scorer: impl ConfidenceScorer + 'static) -> Self {
        self.scorer = Box::new(scorer);
        self
    }

    /// Attach a guild; attaching one already present keeps its replica
    ///
    /// # Errors
    ///
    /// Returns `NotMember` if this member is not on the roster
    pub fn attach(&mut self, guild: Guild) -> Result<(), GuildError> {
        if self.replicas.contains_key(&guild.name) {
            debug!(guild = %guild.name, "guild already attached");
            return Ok(());
        }
        let name = guild.name.clone();
        let replica = GuildSync::new(
            self.config.member.clone(),
            guild,
            Arc::clone(&self.graph),
            self.config.sync.clone(),
        )?;
        self.replicas.insert(name.clone(), Arc::new(Mutex::new(replica)));
        info!(member = %self.config.member, guild = %name, "guild attached");
        Ok(())
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Shared register-cache store
    #[must_use]
    pub fn store(&self) -> &Arc<RegisterCacheStore> {
        &self.store
    }

    /// Branch scheduler
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Replica of an attached guild
    ///
    /// # Errors
    ///
    /// Returns `UnknownGuild` if the guild is not attached
    pub fn replica(&self, guild: &GuildName) -> Result<&Arc<Mutex<GuildSync>>, GuildError> {
        self.replicas
            .get(guild)
            .ok_or_else(|| GuildError::UnknownGuild(guild.clone()))
    }

    /// Score an edit and propose it to the guild
    ///
    /// The confidence is the scorer's reading of the edit's condition
    /// evaluated against the store; an unevaluable condition scores zero.
    ///
    /// # Errors
    ///
    /// Returns `UnknownGuild`, or the replica's proposal error
    pub async fn submit(&self, guild: &GuildName, edit: RuleEdit) -> Result<EditId, GuildError> {
        let replica = self.replica(guild)?;
        let mut sync = replica.lock().await;
        let chain = match &edit {
            RuleEdit::Define(directive) => directive.condition.clone(),
            RuleEdit::Toggle {
                condition: Some(condition),
                ..
            } => condition.clone(),
            other => sync
                .rules()
                .effective_condition(other.target())
                .unwrap_or_default(),
        };
        let confidence = match self
            .proof
            .evaluate_traced(&chain, &Bindings::new(), self.store.as_ref())
        {
            Ok(trace) => self.scorer.score(&trace),
            Err(err) => {
                debug!(%err, "condition not evaluable, scoring zero");
                Confidence::ZERO
            }
        };
        sync.propose(edit, confidence)
    }

    /// Propose an edit with an explicit confidence
    ///
    /// # Errors
    ///
    /// Returns `UnknownGuild`, or the replica's proposal error
    pub async fn submit_with_confidence(
        &self,
        guild: &GuildName,
        edit: RuleEdit,
        confidence: Confidence,
    ) -> Result<EditId, GuildError> {
        self.replica(guild)?.lock().await.propose(edit, confidence)
    }

    /// Current rule set version of a guild
    ///
    /// # Errors
    ///
    /// Returns `UnknownGuild` if the guild is not attached
    pub async fn version(&self, guild: &GuildName) -> Result<RuleVersion, GuildError> {
        Ok(self.replica(guild)?.lock().await.version())
    }

    /// This member's view across every attached guild
    pub async fn member_view(&self) -> GuildMember {
        let mut view = GuildMember::new(self.config.member.clone());
        for replica in self.replicas.values() {
            let partial = replica.lock().await.member_view();
            view.versions.extend(partial.versions);
            view.clock.merge(&partial.clock);
        }
        view
    }

    /// Spawn one branch per active directive of a guild's committed rules
    ///
    /// # Errors
    ///
    /// Returns `UnknownGuild`, or `Exec` if a directive lineage is broken
    pub async fn run_directives(
        &self,
        guild: &GuildName,
        bindings: &Bindings,
    ) -> Result<Vec<BranchId>, GuildError> {
        let rules = self.replica(guild)?.lock().await.rules().clone();
        Ok(self.scheduler.spawn_directives(&rules, bindings).await?)
    }

    /// Spawn a branch over the configured entry route against a guild's vault
    ///
    /// # Errors
    ///
    /// Returns `UnknownGuild` if the guild is not attached
    pub async fn run_route(&self, guild: &GuildName, bindings: Bindings) -> Result<BranchId, GuildError> {
        let vault = self.replica(guild)?.lock().await.rules().vault().clone();
        let branch = RuleBranch::new(self.config.entry.clone()).with_bindings(bindings);
        Ok(self
            .scheduler
            .spawn(branch, Arc::clone(&self.graph), vault)
            .await)
    }

    /// Force cancellation of a rule branch
    pub async fn cancel_branch(&self, id: BranchId) -> bool {
        self.scheduler.cancel(id).await
    }

    /// Wait for every branch and report the outcomes
    pub async fn join_branches(&self) -> Vec<BranchReport> {
        self.scheduler.join_all().await
    }

    /// Build a coordinator driving every attached replica over `transport`
    #[must_use]
    pub fn coordinator(&self, transport: Arc<dyn PeerTransport>) -> GuildCoordinator {
        self.replicas.iter().fold(
            GuildCoordinator::new(transport, self.config.retry.clone()),
            |coordinator, (name, replica)| coordinator.with_replica(Arc::clone(replica), name.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use celarion_core::{DirectiveId, MemberId, NodeId};
    use celarion_graph::{Edge, StreamNode};
    use celarion_proof::{CompareOp, Predicate, ProofChain, ProofStep};
    use celarion_rules::Directive;
    use celarion_runtime::BranchStatus;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn member(name: &str) -> MemberId {
        MemberId::new(name).unwrap()
    }

    fn ops() -> GuildName {
        GuildName::new("ops").unwrap()
    }

    fn graph() -> Arc<StreamGraph> {
        Arc::new(
            StreamGraph::from_parts(
                vec![StreamNode::branch(0), StreamNode::terminal(1)],
                vec![Edge::trigger(0, 1)],
            )
            .unwrap(),
        )
    }

    fn config(name: &str, peers: &[&str]) -> NodeConfig {
        let mut guild = Guild::new(ops()).with_member(member(name), 1);
        for peer in peers {
            guild = guild.with_member(member(peer), 1);
        }
        NodeConfig::new(member(name))
            .with_guild(guild)
            .with_entry(vec![NodeId::from(0)])
    }

    fn node(name: &str, peers: &[&str]) -> GuildNode {
        GuildNode::new(config(name, peers), graph(), Arc::new(RegisterCacheStore::new())).unwrap()
    }

    fn directive(name: &str, condition: ProofChain) -> RuleEdit {
        RuleEdit::Define(Directive::new(
            DirectiveId::new(name).unwrap(),
            condition,
            vec![NodeId::from(0)],
        ))
    }

    #[tokio::test]
    async fn test_solo_member_commits_and_runs_directives() {
        let node = node("a", &[]);
        node.submit(&ops(), directive("d1", ProofChain::new())).await.unwrap();
        assert_eq!(node.version(&ops()).await.unwrap(), RuleVersion(0));

        // settle window
        for _ in 0..2 {
            node.replica(&ops()).unwrap().lock().await.tick().unwrap();
        }
        assert_eq!(node.version(&ops()).await.unwrap(), RuleVersion(1));

        let ids = node.run_directives(&ops(), &Bindings::new()).await.unwrap();
        assert_eq!(ids.len(), 1);
        let reports = node.join_branches().await;
        assert_eq!(reports[0].status, BranchStatus::Completed);
    }

    #[tokio::test]
    async fn test_submit_scores_condition() {
        let node = node("a", &["b"]);
        let failing = ProofChain::new().with_step(ProofStep::new(Predicate::binding_cmp(
            "missing",
            CompareOp::Eq,
            1,
        )));
        let id = node.submit(&ops(), directive("d1", failing)).await.unwrap();
        let outbox = node.replica(&ops()).unwrap().lock().await.drain_outbox();
        let confidence = outbox
            .iter()
            .find_map(|out| match &out.envelope.message {
                crate::message::GuildMessage::Propose {
                    edit_id,
                    confidence,
                    ..
                } if *edit_id == id => Some(*confidence),
                _ => None,
            })
            .unwrap();
        assert!(confidence < Confidence::FULL);
    }

    #[tokio::test]
    async fn test_unknown_guild() {
        let node = node("a", &[]);
        let other = GuildName::new("dev").unwrap();
        assert_eq!(
            node.version(&other).await.unwrap_err(),
            GuildError::UnknownGuild(other.clone())
        );
        assert!(matches!(
            node.run_route(&other, Bindings::new()).await,
            Err(GuildError::UnknownGuild(_))
        ));
    }

    #[tokio::test]
    async fn test_run_route_and_member_view() {
        let node = node("a", &[]);
        let id = node.run_route(&ops(), Bindings::new().with("x", 1)).await.unwrap();
        let reports = node.join_branches().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, id);
        assert_eq!(reports[0].status, BranchStatus::Completed);

        let view = node.member_view().await;
        assert_eq!(view.id, member("a"));
        assert_eq!(view.version(&ops()), Some(RuleVersion(0)));
    }

    #[tokio::test]
    async fn test_nodes_converge_through_coordinators() {
        let net = MemoryNetwork::new();
        let a = node("a", &["b"]);
        let b = node("b", &["a"]);
        let cancel = CancellationToken::new();
        let ca = a.coordinator(Arc::new(net.endpoint(member("a")).unwrap()));
        let cb = b.coordinator(Arc::new(net.endpoint(member("b")).unwrap()));
        let ha = tokio::spawn(ca.run(cancel.clone()));
        let hb = tokio::spawn(cb.run(cancel.clone()));

        a.submit_with_confidence(&ops(), directive("d1", ProofChain::new()), Confidence::FULL)
            .await
            .unwrap();
        for _ in 0..200 {
            if b.version(&ops()).await.unwrap() == RuleVersion(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        ha.await.unwrap().unwrap();
        hb.await.unwrap().unwrap();

        assert_eq!(a.version(&ops()).await.unwrap(), RuleVersion(1));
        assert_eq!(b.version(&ops()).await.unwrap(), RuleVersion(1));
    }
}
