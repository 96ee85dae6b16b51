//! Simulation harness driving one guild of in-process replicas.
//!
//! The harness owns a [`GuildSync`] per member and pumps their outboxes
//! through a [`SimNetwork`]. Logical time only moves through the harness:
//! members tick when the network goes idle, and at random between
//! deliveries so rounds can close before every proposal has arrived.

use crate::network::{Delivery, NetworkConditions, SimNetwork};
use crate::record::{SimEvent, SimRecord};
use crate::seed::SimSeed;
use celarion_core::{CoreError, EditId, ExitCode, Hash, MemberId, RuleVersion};
use celarion_graph::StreamGraph;
use celarion_guild::{EditState, Guild, GuildError, GuildSync, RetryPolicy, SyncConfig};
use celarion_proof::Confidence;
use celarion_rules::RuleEdit;
use indexmap::IndexMap;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Simulation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    /// A replica reported an error the run cannot continue past
    #[error(transparent)]
    Guild(#[from] GuildError),

    /// Replica state could not be encoded
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Member is not part of the simulated guild
    #[error("Unknown member: {0}")]
    UnknownMember(MemberId),

    /// The run did not quiesce within its step budget
    #[error("Simulation stalled after {steps} steps")]
    Stalled {
        /// Steps taken
        steps: u64,
    },
}

impl SimError {
    /// Exit code for the CLI
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::Guild(err) => err.exit_code(),
            _ => ExitCode::Failure,
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Seed naming the delivery permutation
    pub seed: SimSeed,
    /// Simulated guild; every roster member gets a replica
    pub guild: Guild,
    /// Round settings shared by every replica
    #[serde(default)]
    pub sync: SyncConfig,
    /// Fault settings
    #[serde(default)]
    pub network: NetworkConditions,
    /// Attempts before a sender marks an unreachable peer stale
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Chance per step, in thousandths, of a random member tick
    #[serde(default)]
    pub tick_per_mille: u16,
    /// Step budget
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Keep an event record
    #[serde(default)]
    pub record_events: bool,
}

fn default_max_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

fn default_max_steps() -> u64 {
    100_000
}

impl SimConfig {
    /// Create a config for `guild`
    #[must_use]
    pub fn new(seed: SimSeed, guild: Guild) -> Self {
        Self {
            seed,
            guild,
            sync: SyncConfig::default(),
            network: NetworkConditions::default(),
            max_attempts: default_max_attempts(),
            tick_per_mille: 0,
            max_steps: default_max_steps(),
            record_events: false,
        }
    }

    /// Set round settings
    #[must_use]
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Set fault settings
    #[must_use]
    pub fn with_network(mut self, network: NetworkConditions) -> Self {
        self.network = network;
        self
    }

    /// Set the retry budget for unreachable peers
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the random tick rate
    #[must_use]
    pub fn with_tick_rate(mut self, per_mille: u16) -> Self {
        self.tick_per_mille = per_mille.min(1000);
        self
    }

    /// Set the step budget
    #[must_use]
    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps = steps;
        self
    }

    /// Keep an event record
    #[must_use]
    pub fn with_recording(mut self) -> Self {
        self.record_events = true;
        self
    }
}

/// One edit to propose at the start of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposing member
    pub author: MemberId,
    /// Edit
    pub edit: RuleEdit,
    /// Author's confidence
    pub confidence: Confidence,
}

impl Proposal {
    /// Create a proposal
    #[must_use]
    pub fn new(author: MemberId, edit: RuleEdit, confidence: Confidence) -> Self {
        Self {
            author,
            edit,
            confidence,
        }
    }
}

/// Final state of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberOutcome {
    /// Member
    pub member: MemberId,
    /// Rule set version
    pub version: RuleVersion,
    /// Rule set fingerprint
    pub fingerprint: Hash,
    /// Peers this member stopped waiting for
    pub stale: Vec<MemberId>,
    /// Conflicts this member resolved
    pub conflicts: usize,
}

/// Final state of one proposed edit, as its author sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOutcome {
    /// Edit
    pub edit_id: EditId,
    /// Author
    pub author: MemberId,
    /// State on the author
    pub state: Option<EditState>,
    /// Base version the author was told to rebase onto
    pub rebase: Option<RuleVersion>,
}

/// Result of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimResult {
    /// Seed of the run
    pub seed: SimSeed,
    /// Steps taken
    pub steps: u64,
    /// Member ticks taken
    pub ticks: u64,
    /// Per-member outcomes in roster order
    pub members: Vec<MemberOutcome>,
    /// Per-edit outcomes in proposal order
    pub edits: Vec<EditOutcome>,
    /// Non-fatal protocol errors
    pub errors: Vec<GuildError>,
    /// Event record, if kept
    pub record: Option<SimRecord>,
}

impl SimResult {
    /// Outcome for one member
    #[must_use]
    pub fn member(&self, member: &MemberId) -> Option<&MemberOutcome> {
        self.members.iter().find(|m| &m.member == member)
    }

    /// Outcome for one edit
    #[must_use]
    pub fn edit(&self, edit_id: &EditId) -> Option<&EditOutcome> {
        self.edits.iter().find(|e| &e.edit_id == edit_id)
    }

    /// True if every member outside `cut` holds the same rule set
    #[must_use]
    pub fn converged(&self, cut: &[MemberId]) -> bool {
        let mut live = self.members.iter().filter(|m| !cut.contains(&m.member));
        let Some(first) = live.next() else {
            return true;
        };
        live.all(|m| m.version == first.version && m.fingerprint == first.fingerprint)
    }

    /// Exit code summarizing the run
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        let stale = self.members.iter().any(|m| !m.stale.is_empty());
        let base = if stale {
            ExitCode::PeerUnreachable
        } else {
            ExitCode::Success
        };
        self.errors
            .iter()
            .fold(base, |code, err| code.worst(err.exit_code()))
    }
}

/// Deterministic in-process guild
#[derive(Debug)]
pub struct SimHarness {
    config: SimConfig,
    replicas: IndexMap<MemberId, GuildSync>,
    network: SimNetwork,
    ticker: ChaCha8Rng,
    record: SimRecord,
    proposals: Vec<(EditId, MemberId)>,
    errors: Vec<GuildError>,
    steps: u64,
    ticks: u64,
}

impl SimHarness {
    /// Create a replica for every roster member
    ///
    /// # Errors
    ///
    /// Returns `Guild` if the roster is unusable
    pub fn new(config: SimConfig, graph: Arc<StreamGraph>) -> Result<Self, SimError> {
        let mut replicas = IndexMap::new();
        for member in config.guild.members() {
            let replica = GuildSync::new(
                member.clone(),
                config.guild.clone(),
                Arc::clone(&graph),
                config.sync.clone(),
            )?;
            replicas.insert(member.clone(), replica);
        }
        let network = SimNetwork::new(&config.seed, config.network.clone(), config.max_attempts);
        Ok(Self {
            ticker: config.seed.derive("ticks").rng(),
            record: SimRecord::new(config.seed.clone()),
            network,
            replicas,
            proposals: Vec::new(),
            errors: Vec::new(),
            steps: 0,
            ticks: 0,
            config,
        })
    }

    /// Replica of one member
    #[must_use]
    pub fn replica(&self, member: &MemberId) -> Option<&GuildSync> {
        self.replicas.get(member)
    }

    /// Bring every replica to a common history by committing `edits` one
    /// round at a time from `author`
    ///
    /// # Errors
    ///
    /// Returns the first replica error, or `Stalled`
    pub fn prepare(&mut self, author: &MemberId, edits: Vec<RuleEdit>) -> Result<(), SimError> {
        for edit in edits {
            self.propose(Proposal::new(author.clone(), edit, Confidence::FULL))?;
            self.run_to_quiescence()?;
        }
        self.proposals.clear();
        Ok(())
    }

    /// Propose an edit on its author's replica
    ///
    /// # Errors
    ///
    /// Returns `UnknownMember`, or the replica's proposal error
    pub fn propose(&mut self, proposal: Proposal) -> Result<EditId, SimError> {
        let replica = self
            .replicas
            .get_mut(&proposal.author)
            .ok_or_else(|| SimError::UnknownMember(proposal.author.clone()))?;
        let edit_id = replica.propose(proposal.edit, proposal.confidence)?;
        self.note(SimEvent::Proposed {
            member: proposal.author.clone(),
            edit_id,
        });
        self.proposals.push((edit_id, proposal.author));
        Ok(edit_id)
    }

    /// Propose every edit before any delivery, then run to quiescence
    ///
    /// # Errors
    ///
    /// Returns the first proposal error, a fatal replica error, or `Stalled`
    pub fn run(&mut self, proposals: Vec<Proposal>) -> Result<SimResult, SimError> {
        for proposal in proposals {
            self.propose(proposal)?;
        }
        self.run_to_quiescence()?;
        let result = self.result()?;
        info!(
            seed = %self.config.seed,
            steps = result.steps,
            ticks = result.ticks,
            converged = result.converged(&self.config.network.cut.iter().cloned().collect::<Vec<_>>()),
            "simulation finished"
        );
        Ok(result)
    }

    /// Pump messages and ticks until nothing is in flight and no round is open
    ///
    /// # Errors
    ///
    /// Returns a fatal replica error, or `Stalled` once the step budget is spent
    pub fn run_to_quiescence(&mut self) -> Result<(), SimError> {
        loop {
            self.collect();
            if self.network.is_idle() && self.replicas.values().all(|r| r.open_rounds() == 0) {
                return Ok(());
            }
            if self.steps >= self.config.max_steps {
                return Err(SimError::Stalled { steps: self.steps });
            }
            self.steps += 1;

            if self.network.is_idle() {
                self.tick_all()?;
                continue;
            }
            if self.network.roll(self.config.tick_per_mille) {
                let index = self.ticker.gen_range(0..self.replicas.len());
                self.tick_one(index)?;
                continue;
            }
            let Some(delivery) = self.network.step() else {
                continue;
            };
            self.deliver(delivery)?;
        }
    }

    fn collect(&mut self) {
        for replica in self.replicas.values_mut() {
            for outgoing in replica.drain_outbox() {
                self.network.submit(outgoing);
            }
        }
    }

    fn deliver(&mut self, delivery: Delivery) -> Result<(), SimError> {
        match delivery {
            Delivery::Deliver {
                to,
                envelope,
                duplicate,
            } => {
                self.note(SimEvent::Delivered {
                    from: envelope.sender.clone(),
                    to: to.clone(),
                    kind: envelope.message.kind().to_string(),
                    edit_id: envelope.message.edit_id(),
                    duplicate,
                });
                let Some(replica) = self.replicas.get_mut(&to) else {
                    debug!(%to, "envelope for a member outside the simulation");
                    return Ok(());
                };
                let outcome = replica.handle(envelope);
                self.absorb(outcome)
            }
            Delivery::Lost { from, to } => {
                self.note(SimEvent::Lost { from, to });
                Ok(())
            }
            Delivery::Failed { from, to, attempts } => {
                self.note(SimEvent::Failed {
                    from: from.clone(),
                    to: to.clone(),
                    attempts,
                });
                if attempts < self.config.max_attempts {
                    return Ok(());
                }
                let Some(replica) = self.replicas.get_mut(&from) else {
                    return Ok(());
                };
                if replica.is_stale(&to) {
                    return Ok(());
                }
                let outcome = replica.mark_stale(&to);
                self.note(SimEvent::Stale { member: from, peer: to });
                self.absorb(outcome)
            }
        }
    }

    fn tick_all(&mut self) -> Result<(), SimError> {
        for index in 0..self.replicas.len() {
            self.tick_one(index)?;
        }
        Ok(())
    }

    fn tick_one(&mut self, index: usize) -> Result<(), SimError> {
        let Some((member, replica)) = self.replicas.get_index_mut(index) else {
            return Ok(());
        };
        let member = member.clone();
        let outcome = replica.tick();
        self.ticks += 1;
        self.note(SimEvent::Tick { member });
        self.absorb(outcome)
    }

    /// Keep protocol errors, stop on fatal ones
    fn absorb(&mut self, outcome: Result<(), GuildError>) -> Result<(), SimError> {
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                warn!(%err, step = self.steps, "replica reported an error");
                self.errors.push(err);
                Ok(())
            }
        }
    }

    fn note(&mut self, event: SimEvent) {
        if self.config.record_events {
            self.record.push(self.steps, event);
        }
    }

    /// Snapshot the current outcome
    ///
    /// # Errors
    ///
    /// Returns `Core` if a rule set cannot be fingerprinted
    pub fn result(&self) -> Result<SimResult, SimError> {
        let mut members = Vec::with_capacity(self.replicas.len());
        for (member, replica) in &self.replicas {
            members.push(MemberOutcome {
                member: member.clone(),
                version: replica.version(),
                fingerprint: replica.rules().fingerprint()?,
                stale: replica
                    .guild()
                    .members()
                    .filter(|peer| replica.is_stale(peer))
                    .cloned()
                    .collect(),
                conflicts: replica.conflicts().len(),
            });
        }
        let edits = self
            .proposals
            .iter()
            .map(|(edit_id, author)| {
                let replica = self.replicas.get(author);
                EditOutcome {
                    edit_id: *edit_id,
                    author: author.clone(),
                    state: replica.and_then(|r| r.state(edit_id)),
                    rebase: replica.and_then(|r| r.rebase_for(edit_id)),
                }
            })
            .collect();
        Ok(SimResult {
            seed: self.config.seed.clone(),
            steps: self.steps,
            ticks: self.ticks,
            members,
            edits,
            errors: self.errors.clone(),
            record: self.config.record_events.then(|| self.record.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celarion_core::{DirectiveId, GuildName, NodeId};
    use celarion_graph::{Edge, StreamNode};
    use celarion_proof::ProofChain;
    use celarion_rules::Directive;

    fn member(name: &str) -> MemberId {
        MemberId::new(name).unwrap()
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

    fn define(name: &str) -> RuleEdit {
        RuleEdit::Define(Directive::new(
            DirectiveId::new(name).unwrap(),
            ProofChain::new(),
            vec![NodeId::from(0)],
        ))
    }

    fn guild(names: &[&str]) -> Guild {
        names.iter().fold(Guild::new(GuildName::new("ops").unwrap()), |g, n| {
            g.with_member(member(n), 1)
        })
    }

    #[test]
    fn test_single_proposal_commits_everywhere() {
        let config = SimConfig::new(SimSeed::from_literal(1), guild(&["a", "b", "c"])).with_recording();
        let mut sim = SimHarness::new(config, graph()).unwrap();
        let result = sim
            .run(vec![Proposal::new(member("a"), define("d1"), Confidence::FULL)])
            .unwrap();

        assert!(result.converged(&[]));
        assert!(result.members.iter().all(|m| m.version == RuleVersion(1)));
        assert_eq!(result.edits[0].state, Some(EditState::Committed));
        assert_eq!(result.exit_code(), ExitCode::Success);
        assert!(result.record.unwrap().event_count() > 0);
    }

    #[test]
    fn test_prepare_advances_everyone() {
        let config = SimConfig::new(SimSeed::from_literal(2), guild(&["a", "b"]));
        let mut sim = SimHarness::new(config, graph()).unwrap();
        sim.prepare(&member("a"), vec![define("s1"), define("s2")]).unwrap();
        assert_eq!(sim.replica(&member("b")).unwrap().version(), RuleVersion(2));
        assert!(sim.result().unwrap().edits.is_empty());
    }

    #[test]
    fn test_unknown_author() {
        let config = SimConfig::new(SimSeed::from_literal(3), guild(&["a"]));
        let mut sim = SimHarness::new(config, graph()).unwrap();
        let err = sim
            .propose(Proposal::new(member("z"), define("d1"), Confidence::FULL))
            .unwrap_err();
        assert_eq!(err, SimError::UnknownMember(member("z")));
    }

    #[test]
    fn test_step_budget() {
        let config = SimConfig::new(SimSeed::from_literal(4), guild(&["a", "b"])).with_max_steps(1);
        let mut sim = SimHarness::new(config, graph()).unwrap();
        let err = sim
            .run(vec![Proposal::new(member("a"), define("d1"), Confidence::FULL)])
            .unwrap_err();
        assert!(matches!(err, SimError::Stalled { .. }));
    }
}
