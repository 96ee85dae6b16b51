//! GuildSync replica state machine.
//!
//! One [`GuildSync`] holds a member's replica of one guild's rule set.
//! It is a pure state machine: envelopes go in through
//! [`GuildSync::handle`], ticks through [`GuildSync::tick`], and outgoing
//! envelopes collect in an outbox the caller drains. The coordinator and
//! the simulation harness drive it the same way.
//!
//! Edits move `Proposed -> Validating -> {Accepted | Conflicted} ->
//! {Committed | Rejected}`. Proposals are grouped into rounds by base
//! version. A round closes once its settle window has passed and every
//! live member has voted on every candidate. A candidate is eligible only
//! if every live member accepted it, which keeps the outcome identical on
//! every member regardless of delivery order.

use crate::config::SyncConfig;
use crate::conflict::{ConflictRecord, Contender};
use crate::error::GuildError;
use crate::membership::{Guild, GuildMember};
use crate::message::{Envelope, GuildMessage, VoteOutcome};
use celarion_core::{
    CanonicalEncode, EditId, GuildName, LogicalTime, MemberId, RuleVersion, VectorClock,
};
use celarion_graph::StreamGraph;
use celarion_proof::Confidence;
use celarion_rules::{RuleEdit, RuleLog, RuleSet};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle of one edit on this member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditState {
    /// Known, not yet voted on (held until this member reaches its base)
    Proposed,
    /// Voted on, waiting for the round to close
    Validating,
    /// Sole eligible candidate of its round
    Accepted,
    /// One of several candidates of its round
    Conflicted,
    /// Applied to the rule set
    Committed,
    /// Lost its round or was rejected on arrival
    Rejected,
}

impl EditState {
    /// True for `Committed` and `Rejected`
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Committed | Self::Rejected)
    }
}

/// An envelope and the members it goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Recipients
    pub to: Vec<MemberId>,
    /// Envelope
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
struct Candidate {
    edit: RuleEdit,
    author: MemberId,
    confidence: Confidence,
}

#[derive(Debug, Clone)]
struct Round {
    opened_at: LogicalTime,
    candidates: IndexMap<EditId, Candidate>,
    claim: Option<EditId>,
}

impl Round {
    fn new(opened_at: LogicalTime) -> Self {
        Self {
            opened_at,
            candidates: IndexMap::new(),
            claim: None,
        }
    }
}

/// A member's replica of one guild
#[derive(Debug)]
pub struct GuildSync {
    member: MemberId,
    guild: Guild,
    config: SyncConfig,
    rules: RuleSet,
    log: RuleLog,
    clock: VectorClock,
    now: LogicalTime,
    rounds: BTreeMap<RuleVersion, Round>,
    votes: IndexMap<EditId, IndexMap<MemberId, VoteOutcome>>,
    states: IndexMap<EditId, EditState>,
    rebases: IndexMap<EditId, RuleVersion>,
    finalized: VecDeque<(RuleVersion, EditId)>,
    buffered: IndexMap<EditId, RuleVersion>,
    stale: IndexSet<MemberId>,
    conflicts: Vec<ConflictRecord>,
    outbox: Vec<Outgoing>,
}

impl GuildSync {
    /// Create a replica with an empty rule set over `graph`
    ///
    /// # Errors
    ///
    /// Returns error if `member` is not on the guild roster
    pub fn new(
        member: MemberId,
        guild: Guild,
        graph: Arc<StreamGraph>,
        config: SyncConfig,
    ) -> Result<Self, GuildError> {
        Self::from_log(member, guild, graph, RuleLog::new(), config)
    }

    /// Resume a replica from its persisted log
    ///
    /// # Errors
    ///
    /// Returns error if the roster is unusable or the log does not replay
    pub fn from_log(
        member: MemberId,
        guild: Guild,
        graph: Arc<StreamGraph>,
        log: RuleLog,
        config: SyncConfig,
    ) -> Result<Self, GuildError> {
        guild.validate_for(&member)?;
        let rules = log.replay(graph)?;
        Ok(Self {
            member,
            guild,
            config,
            rules,
            log,
            clock: VectorClock::new(),
            now: LogicalTime::zero(),
            rounds: BTreeMap::new(),
            votes: IndexMap::new(),
            states: IndexMap::new(),
            rebases: IndexMap::new(),
            finalized: VecDeque::new(),
            buffered: IndexMap::new(),
            stale: IndexSet::new(),
            conflicts: Vec::new(),
            outbox: Vec::new(),
        })
    }

    /// This member
    #[must_use]
    pub fn member(&self) -> &MemberId {
        &self.member
    }

    /// Guild name
    #[must_use]
    pub fn guild_name(&self) -> &GuildName {
        &self.guild.name
    }

    /// Guild roster
    #[must_use]
    pub fn guild(&self) -> &Guild {
        &self.guild
    }

    /// Committed version
    #[must_use]
    pub fn version(&self) -> RuleVersion {
        self.rules.version()
    }

    /// Committed rule set
    #[must_use]
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Committed edit log
    #[must_use]
    pub fn log(&self) -> &RuleLog {
        &self.log
    }

    /// Local vector clock
    #[must_use]
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Local logical time
    #[must_use]
    pub fn now(&self) -> LogicalTime {
        self.now
    }

    /// State of an edit, if known. Committed edits stay known through the
    /// log after their state is trimmed.
    #[must_use]
    pub fn state(&self, edit_id: &EditId) -> Option<EditState> {
        self.states
            .get(edit_id)
            .copied()
            .or_else(|| self.log.contains(edit_id).then_some(EditState::Committed))
    }

    /// Number of edits whose state is tracked outside the log
    #[must_use]
    pub fn tracked_edits(&self) -> usize {
        self.states.len()
    }

    /// Base version a rejected edit should be rebased onto
    #[must_use]
    pub fn rebase_for(&self, edit_id: &EditId) -> Option<RuleVersion> {
        self.rebases.get(edit_id).copied()
    }

    /// Rounds that had more than one candidate, oldest first
    #[must_use]
    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.conflicts
    }

    /// True if `peer` was marked stale
    #[must_use]
    pub fn is_stale(&self, peer: &MemberId) -> bool {
        self.stale.contains(peer)
    }

    /// Number of rounds not yet closed
    #[must_use]
    pub fn open_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Member view for the control surface
    #[must_use]
    pub fn member_view(&self) -> GuildMember {
        let mut view = GuildMember::new(self.member.clone());
        view.versions.insert(self.guild.name.clone(), self.version());
        view.clock = self.clock.clone();
        view
    }

    /// Take every envelope queued since the last drain
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Propose an edit against the current version
    ///
    /// # Errors
    ///
    /// Returns `Rule` if the edit does not validate locally, or any error
    /// raised while closing rounds
    pub fn propose(&mut self, edit: RuleEdit, confidence: Confidence) -> Result<EditId, GuildError> {
        self.rules.check(&edit)?;
        let base = self.version();
        let edit_id = Self::edit_id_for(&self.member, base, &edit)?;
        if self.state(&edit_id).is_some() {
            return Ok(edit_id);
        }

        info!(member = %self.member, %edit_id, %base, %confidence, edit = %edit, "edit proposed");
        self.votes
            .entry(edit_id)
            .or_default()
            .insert(self.member.clone(), VoteOutcome::Accept);
        self.states.insert(edit_id, EditState::Validating);
        self.rounds
            .entry(base)
            .or_insert_with(|| Round::new(self.now))
            .candidates
            .insert(
                edit_id,
                Candidate {
                    edit: edit.clone(),
                    author: self.member.clone(),
                    confidence,
                },
            );
        self.broadcast(GuildMessage::Propose {
            edit_id,
            edit,
            base_version: base,
            confidence,
        });
        self.try_close()?;
        Ok(edit_id)
    }

    /// Handle one received envelope
    ///
    /// # Errors
    ///
    /// Returns `NotMember` for foreign senders, `ConflictUnresolved` when
    /// a commit disagrees with local resolution, `StoreCorruption` if the
    /// log rejects a commit
    pub fn handle(&mut self, envelope: Envelope) -> Result<(), GuildError> {
        if envelope.guild != self.guild.name {
            return Err(GuildError::UnknownGuild(envelope.guild));
        }
        if !self.guild.contains(&envelope.sender) || envelope.sender == self.member {
            return Err(GuildError::NotMember {
                member: envelope.sender,
                guild: self.guild.name.clone(),
            });
        }
        self.clock.merge(&envelope.clock);
        self.clock.increment(&self.member);

        let sender = envelope.sender;
        debug!(member = %self.member, %sender, kind = envelope.message.kind(), edit_id = %envelope.message.edit_id(), "message received");
        match envelope.message {
            GuildMessage::Propose {
                edit_id,
                edit,
                base_version,
                confidence,
            } => self.on_propose(sender, edit_id, edit, base_version, confidence)?,
            GuildMessage::Vote { edit_id, outcome } => self.on_vote(sender, edit_id, outcome),
            GuildMessage::Commit {
                edit_id,
                new_version,
            } => self.on_commit(&sender, edit_id, new_version)?,
            GuildMessage::Rebase {
                edit_id,
                new_base_version,
            } => self.on_rebase(&sender, edit_id, new_base_version),
        }
        self.try_close()
    }

    /// Advance logical time by one tick and close any settled round
    ///
    /// # Errors
    ///
    /// Returns any error raised while closing rounds
    pub fn tick(&mut self) -> Result<(), GuildError> {
        self.now.increment();
        self.try_close()
    }

    /// Stop waiting for `peer`; it keeps its last committed rule set
    ///
    /// # Errors
    ///
    /// Returns any error raised while closing rounds
    pub fn mark_stale(&mut self, peer: &MemberId) -> Result<(), GuildError> {
        if peer == &self.member || !self.guild.contains(peer) {
            return Ok(());
        }
        if self.stale.insert(peer.clone()) {
            warn!(member = %self.member, %peer, "peer marked stale");
        }
        self.try_close()
    }

    fn edit_id_for(author: &MemberId, base: RuleVersion, edit: &RuleEdit) -> Result<EditId, GuildError> {
        let payload = edit
            .encode()
            .map_err(|e| GuildError::Encoding(e.to_string()))?;
        Ok(EditId::derive(author, base.as_u64(), &payload))
    }

    fn on_propose(
        &mut self,
        author: MemberId,
        edit_id: EditId,
        edit: RuleEdit,
        base: RuleVersion,
        confidence: Confidence,
    ) -> Result<(), GuildError> {
        if self.state(&edit_id).is_some() {
            return Ok(());
        }
        if Self::edit_id_for(&author, base, &edit)? != edit_id {
            warn!(member = %self.member, %author, %edit_id, "proposal id does not match its content, dropped");
            return Ok(());
        }

        let version = self.version();
        if base < version {
            if self.buffered.contains_key(&edit_id) {
                return Err(GuildError::ConflictUnresolved {
                    edit_id,
                    reason: format!("committed by a peer on {base}, but {version} was committed here"),
                });
            }
            info!(member = %self.member, %edit_id, %base, %version, "late proposal rejected");
            self.finalize(edit_id, EditState::Rejected);
            self.rebases.insert(edit_id, version);
            self.votes.shift_remove(&edit_id);
            self.broadcast(GuildMessage::Vote {
                edit_id,
                outcome: VoteOutcome::Reject,
            });
            self.send(
                author,
                GuildMessage::Rebase {
                    edit_id,
                    new_base_version: version,
                },
            );
            return Ok(());
        }

        self.votes
            .entry(edit_id)
            .or_default()
            .insert(author.clone(), VoteOutcome::Accept);
        self.states.insert(edit_id, EditState::Proposed);
        let now = self.now;
        let round = self.rounds.entry(base).or_insert_with(|| Round::new(now));
        round.candidates.insert(
            edit_id,
            Candidate {
                edit,
                author,
                confidence,
            },
        );
        if let Some(new_version) = self.buffered.shift_remove(&edit_id) {
            self.claim(base, edit_id, new_version)?;
        }

        if base == version {
            self.vote_on(base, edit_id);
        } else {
            debug!(member = %self.member, %edit_id, %base, %version, "future proposal held");
        }
        Ok(())
    }

    fn on_vote(&mut self, voter: MemberId, edit_id: EditId, outcome: VoteOutcome) {
        if self.states.get(&edit_id).is_some_and(EditState::is_final) {
            return;
        }
        self.votes
            .entry(edit_id)
            .or_default()
            .entry(voter)
            .or_insert(outcome);
    }

    fn on_commit(
        &mut self,
        committer: &MemberId,
        edit_id: EditId,
        new_version: RuleVersion,
    ) -> Result<(), GuildError> {
        match self.state(&edit_id) {
            Some(EditState::Committed) => {
                debug!(member = %self.member, %edit_id, "commit redelivered");
                Ok(())
            }
            Some(EditState::Rejected) => Err(GuildError::ConflictUnresolved {
                edit_id,
                reason: format!("{committer} committed {new_version} but the edit was rejected here"),
            }),
            Some(_) => {
                let base = self
                    .rounds
                    .iter()
                    .find(|(_, r)| r.candidates.contains_key(&edit_id))
                    .map(|(base, _)| *base);
                match base {
                    Some(base) => self.claim(base, edit_id, new_version),
                    None => Err(GuildError::ConflictUnresolved {
                        edit_id,
                        reason: "commit for an edit outside every open round".to_string(),
                    }),
                }
            }
            None => {
                debug!(member = %self.member, %edit_id, %committer, "commit for unknown edit buffered");
                self.buffered.insert(edit_id, new_version);
                Ok(())
            }
        }
    }

    fn on_rebase(&mut self, sender: &MemberId, edit_id: EditId, new_base: RuleVersion) {
        let entry = self.rebases.entry(edit_id).or_insert(new_base);
        if *entry < new_base {
            *entry = new_base;
        }
        info!(member = %self.member, %edit_id, %sender, %new_base, "rebase notice");
    }

    fn claim(&mut self, base: RuleVersion, edit_id: EditId, new_version: RuleVersion) -> Result<(), GuildError> {
        if new_version != base.next() {
            return Err(GuildError::ConflictUnresolved {
                edit_id,
                reason: format!("commit to {new_version} from base {base}"),
            });
        }
        let Some(round) = self.rounds.get_mut(&base) else {
            return Ok(());
        };
        if let Some(existing) = round.claim {
            if existing != edit_id {
                return Err(GuildError::ConflictUnresolved {
                    edit_id,
                    reason: format!("{existing} was already committed on {base}"),
                });
            }
        }
        round.claim = Some(edit_id);
        Ok(())
    }

    fn vote_on(&mut self, base: RuleVersion, edit_id: EditId) {
        let Some(candidate) = self.rounds.get(&base).and_then(|r| r.candidates.get(&edit_id)) else {
            return;
        };
        let outcome = match self.rules.check(&candidate.edit) {
            Ok(()) => VoteOutcome::Accept,
            Err(err) => {
                info!(member = %self.member, %edit_id, %err, "candidate fails validation");
                VoteOutcome::Reject
            }
        };
        let own = self
            .votes
            .entry(edit_id)
            .or_default()
            .entry(self.member.clone())
            .or_insert(outcome);
        let outcome = *own;
        self.states.insert(edit_id, EditState::Validating);
        self.broadcast(GuildMessage::Vote { edit_id, outcome });
    }

    fn live_members(&self) -> impl Iterator<Item = &MemberId> {
        self.guild.members().filter(|m| !self.stale.contains(*m))
    }

    fn contenders(&self, round: &Round, optimistic: bool) -> Vec<Contender> {
        round
            .candidates
            .iter()
            .map(|(edit_id, c)| {
                let votes = self.votes.get(edit_id);
                let eligible = self.live_members().all(|m| {
                    match votes.and_then(|v| v.get(m)) {
                        Some(outcome) => outcome.is_accept(),
                        None => optimistic && m != &self.member,
                    }
                });
                Contender {
                    edit_id: *edit_id,
                    author: c.author.clone(),
                    confidence: c.confidence,
                    priority: self.guild.priority(&c.author),
                    eligible,
                }
            })
            .collect()
    }

    fn settled(&self, round: &Round) -> bool {
        if self.now.since(round.opened_at) < self.config.settle_window {
            return false;
        }
        round.candidates.keys().all(|edit_id| {
            let votes = self.votes.get(edit_id);
            self.live_members()
                .all(|m| votes.is_some_and(|v| v.contains_key(m)))
        })
    }

    fn try_close(&mut self) -> Result<(), GuildError> {
        loop {
            let base = self.version();
            let Some(round) = self.rounds.get(&base) else {
                return Ok(());
            };

            if let Some(claim) = round.claim {
                let optimistic = ConflictRecord::resolve(base, self.contenders(round, true));
                if optimistic.winner == Some(claim) {
                    debug!(member = %self.member, edit_id = %claim, %base, "peer commit adopted");
                    self.close_round(base, optimistic)?;
                    continue;
                }
            }

            if !self.settled(round) {
                return Ok(());
            }

            let record = ConflictRecord::resolve(base, self.contenders(round, false));
            if let Some(claim) = round.claim {
                if record.winner != Some(claim) {
                    error!(member = %self.member, edit_id = %claim, winner = ?record.winner, %base, "peer commit disagrees with local resolution");
                    if let Some(round) = self.rounds.get_mut(&base) {
                        round.claim = None;
                    }
                    return Err(GuildError::ConflictUnresolved {
                        edit_id: claim,
                        reason: format!("local winner on {base} is {:?}", record.winner),
                    });
                }
            }
            self.close_round(base, record)?;
        }
    }

    fn close_round(&mut self, base: RuleVersion, record: ConflictRecord) -> Result<(), GuildError> {
        let Some(mut round) = self.rounds.remove(&base) else {
            return Ok(());
        };
        let conflicted = record.is_conflict();
        if conflicted {
            for edit_id in round.candidates.keys() {
                self.states.insert(*edit_id, EditState::Conflicted);
            }
        }

        let mut rebase_to = base;
        if let Some(winner) = record.winner {
            let Some(candidate) = round.candidates.shift_remove(&winner) else {
                return Err(GuildError::StoreCorruption(format!(
                    "winner {winner} missing from round {base}"
                )));
            };
            if !conflicted {
                self.states.insert(winner, EditState::Accepted);
            }
            let version = self.rules.apply(&candidate.edit)?;
            self.log
                .append(version, winner, candidate.author.clone(), candidate.edit)?;
            self.finalize(winner, EditState::Committed);
            self.votes.shift_remove(&winner);
            info!(member = %self.member, edit_id = %winner, author = %candidate.author, %version, conflicted, "edit committed");
            self.broadcast(GuildMessage::Commit {
                edit_id: winner,
                new_version: version,
            });
            rebase_to = version;
        }

        for (edit_id, candidate) in round.candidates {
            self.finalize(edit_id, EditState::Rejected);
            self.votes.shift_remove(&edit_id);
            let entry = self.rebases.entry(edit_id).or_insert(rebase_to);
            if *entry < rebase_to {
                *entry = rebase_to;
            }
            info!(member = %self.member, %edit_id, author = %candidate.author, %rebase_to, "edit rejected");
            if candidate.author != self.member {
                self.send(
                    candidate.author,
                    GuildMessage::Rebase {
                        edit_id,
                        new_base_version: rebase_to,
                    },
                );
            }
        }

        if conflicted {
            self.conflicts.push(record);
        }

        // Held proposals for the new base can be voted on now.
        let version = self.version();
        let held: Vec<EditId> = self
            .rounds
            .get(&version)
            .map(|r| {
                r.candidates
                    .keys()
                    .filter(|id| self.states.get(*id) == Some(&EditState::Proposed))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for edit_id in held {
            self.vote_on(version, edit_id);
        }
        if let Some(next) = self.rounds.get_mut(&version) {
            next.opened_at = next.opened_at.max(self.now);
        }
        self.trim_history();
        Ok(())
    }

    fn finalize(&mut self, edit_id: EditId, state: EditState) {
        self.states.insert(edit_id, state);
        self.finalized.push_back((self.version(), edit_id));
    }

    /// Forget final edit states older than the retained history
    fn trim_history(&mut self) {
        let version = self.version().as_u64();
        while let Some((at, edit_id)) = self.finalized.front().copied() {
            if at.as_u64().saturating_add(self.config.history) >= version {
                break;
            }
            self.finalized.pop_front();
            if self.states.get(&edit_id).is_some_and(EditState::is_final) {
                self.states.shift_remove(&edit_id);
                self.rebases.shift_remove(&edit_id);
            }
        }
    }

    fn broadcast(&mut self, message: GuildMessage) {
        let to: Vec<MemberId> = self
            .guild
            .peers_of(&self.member)
            .filter(|m| !self.stale.contains(*m))
            .cloned()
            .collect();
        self.enqueue(to, message);
    }

    fn send(&mut self, to: MemberId, message: GuildMessage) {
        self.enqueue(vec![to], message);
    }

    fn enqueue(&mut self, to: Vec<MemberId>, message: GuildMessage) {
        if to.is_empty() {
            return;
        }
        self.clock.increment(&self.member);
        let envelope = Envelope::new(
            self.member.clone(),
            self.guild.name.clone(),
            self.clock.clone(),
            message,
        );
        self.outbox.push(Outgoing { to, envelope });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use celarion_core::{DirectiveId, NodeId};
    use celarion_graph::{Edge, StreamNode};
    use celarion_proof::ProofChain;
    use celarion_rules::Directive;

    pub(crate) fn graph() -> Arc<StreamGraph> {
        Arc::new(
            StreamGraph::from_parts(
                vec![StreamNode::trigger(0, vec![]), StreamNode::terminal(1)],
                vec![Edge::trigger(0, 1)],
            )
            .unwrap(),
        )
    }

    pub(crate) fn define(name: &str) -> RuleEdit {
        RuleEdit::Define(Directive::new(
            DirectiveId::new(name).unwrap(),
            ProofChain::new(),
            vec![NodeId(0)],
        ))
    }

    fn member(name: &str) -> MemberId {
        MemberId::new(name).unwrap()
    }

    fn guild(members: &[(&str, u32)]) -> Guild {
        members.iter().fold(Guild::new(GuildName::new("ops").unwrap()), |g, (m, p)| {
            g.with_member(member(m), *p)
        })
    }

    fn replicas(members: &[(&str, u32)]) -> Vec<GuildSync> {
        let guild = guild(members);
        members
            .iter()
            .map(|(m, _)| GuildSync::new(member(m), guild.clone(), graph(), SyncConfig::default()).unwrap())
            .collect()
    }

    fn index(replicas: &[GuildSync], name: &MemberId) -> Option<usize> {
        replicas.iter().position(|r| r.member() == name)
    }

    /// Deliver everything in FIFO order and tick until quiet
    fn pump(replicas: &mut [GuildSync], cut: &[&str]) {
        let mut quiet = 0;
        while quiet < 5 {
            let mut pending = Vec::new();
            for r in replicas.iter_mut() {
                pending.extend(r.drain_outbox());
            }
            if pending.is_empty() {
                quiet += 1;
                for r in replicas.iter_mut() {
                    r.tick().unwrap();
                }
                continue;
            }
            quiet = 0;
            for out in pending {
                if cut.contains(&out.envelope.sender.as_str()) {
                    continue;
                }
                for to in &out.to {
                    if cut.contains(&to.as_str()) {
                        continue;
                    }
                    if let Some(i) = index(replicas, to) {
                        replicas[i].handle(out.envelope.clone()).unwrap();
                    }
                }
            }
        }
    }

    fn advance_to(replicas: &mut [GuildSync], version: u64) {
        for n in replicas[0].version().as_u64()..version {
            replicas[0]
                .propose(define(&format!("seed{n}")), Confidence::FULL)
                .unwrap();
            pump(replicas, &[]);
        }
    }

    #[test]
    fn test_single_proposal_commits_everywhere() {
        let mut rs = replicas(&[("a", 1), ("b", 1), ("c", 1)]);
        let id = rs[0].propose(define("d1"), Confidence::FULL).unwrap();
        assert_eq!(rs[0].state(&id), Some(EditState::Validating));
        pump(&mut rs, &[]);

        for r in &rs {
            assert_eq!(r.version(), RuleVersion(1));
            assert_eq!(r.state(&id), Some(EditState::Committed));
            assert!(r.conflicts().is_empty());
        }
        assert_eq!(rs[0].rules().fingerprint().unwrap(), rs[2].rules().fingerprint().unwrap());
    }

    #[test]
    fn test_concurrent_proposals_higher_confidence_wins() {
        let mut rs = replicas(&[("a", 1), ("b", 1)]);
        advance_to(&mut rs, 3);
        assert_eq!(rs[1].version(), RuleVersion(3));

        let e1 = rs[0].propose(define("e1"), Confidence::from_thousandths(900)).unwrap();
        let e2 = rs[1].propose(define("e2"), Confidence::from_thousandths(600)).unwrap();
        pump(&mut rs, &[]);

        for r in &rs {
            assert_eq!(r.version(), RuleVersion(4));
            assert_eq!(r.state(&e1), Some(EditState::Committed));
            assert_eq!(r.state(&e2), Some(EditState::Rejected));
            assert_eq!(r.conflicts().len(), 1);
            assert_eq!(r.conflicts()[0].winner, Some(e1));
        }
        assert_eq!(rs[1].rebase_for(&e2), Some(RuleVersion(4)));
    }

    #[test]
    fn test_late_proposal_rebased_immediately() {
        let mut rs = replicas(&[("a", 1), ("b", 1)]);
        advance_to(&mut rs, 2);

        let guild = rs[0].guild().clone();
        let mut behind = GuildSync::new(member("b"), guild, graph(), SyncConfig::default()).unwrap();
        let late = behind.propose(define("old"), Confidence::FULL).unwrap();
        let propose = behind
            .drain_outbox()
            .into_iter()
            .next()
            .unwrap()
            .envelope;

        rs[0].handle(propose).unwrap();
        assert_eq!(rs[0].state(&late), Some(EditState::Rejected));
        let out = rs[0].drain_outbox();
        let rebase = out
            .iter()
            .find(|o| matches!(o.envelope.message, GuildMessage::Rebase { .. }))
            .unwrap();
        assert_eq!(rebase.to, vec![member("b")]);
        assert_eq!(
            rebase.envelope.message,
            GuildMessage::Rebase {
                edit_id: late,
                new_base_version: RuleVersion(2)
            }
        );
    }

    #[test]
    fn test_future_proposal_held_until_caught_up() {
        let mut rs = replicas(&[("a", 1), ("b", 1)]);
        let guild = rs[0].guild().clone();

        let first = rs[0].propose(define("d1"), Confidence::FULL).unwrap();
        let first_msgs = rs[0].drain_outbox();
        // b never saw d1; a moves ahead on its own by marking b stale.
        rs[0].mark_stale(&member("b")).unwrap();
        rs[0].tick().unwrap();
        rs[0].tick().unwrap();
        assert_eq!(rs[0].version(), RuleVersion(1));
        rs[0].drain_outbox();

        let mut a = GuildSync::from_log(member("a"), guild, graph(), rs[0].log().clone(), SyncConfig::default()).unwrap();
        let second = a.propose(define("d2"), Confidence::FULL).unwrap();
        let second_msgs = a.drain_outbox();

        for out in second_msgs {
            rs[1].handle(out.envelope).unwrap();
        }
        assert_eq!(rs[1].state(&second), Some(EditState::Proposed));
        assert_eq!(rs[1].version(), RuleVersion(0));

        for out in first_msgs {
            rs[1].handle(out.envelope).unwrap();
        }
        assert_eq!(rs[1].state(&first), Some(EditState::Validating));
        assert_eq!(rs[1].open_rounds(), 2);
    }

    #[test]
    fn test_commit_before_propose_is_buffered() {
        let mut rs = replicas(&[("a", 1), ("b", 1)]);
        let id = rs[0].propose(define("d1"), Confidence::FULL).unwrap();
        let propose = rs[0].drain_outbox().remove(0).envelope;

        rs[1].handle(propose.clone()).unwrap();
        let vote = rs[1].drain_outbox().remove(0).envelope;
        rs[0].handle(vote).unwrap();
        rs[0].tick().unwrap();
        rs[0].tick().unwrap();
        assert_eq!(rs[0].version(), RuleVersion(1));
        let commit = rs[0].drain_outbox().remove(0).envelope;

        let mut late = GuildSync::new(member("b"), rs[0].guild().clone(), graph(), SyncConfig::default()).unwrap();
        late.handle(commit.clone()).unwrap();
        assert_eq!(late.version(), RuleVersion(0));
        late.handle(propose).unwrap();
        assert_eq!(late.version(), RuleVersion(1));
        assert_eq!(late.state(&id), Some(EditState::Committed));

        late.handle(commit).unwrap();
        assert_eq!(late.version(), RuleVersion(1));
        assert_eq!(late.log().len(), 1);
    }

    #[test]
    fn test_invalid_candidate_rejected_everywhere() {
        let mut rs = replicas(&[("a", 1), ("b", 1)]);
        let frozen = RuleEdit::Define(
            Directive::new(DirectiveId::new("fixed").unwrap(), ProofChain::new(), vec![NodeId(0)]).immutable(),
        );
        rs[0].propose(frozen, Confidence::FULL).unwrap();
        pump(&mut rs, &[]);

        let toggle = RuleEdit::Toggle {
            id: DirectiveId::new("fixed").unwrap(),
            condition: None,
            body: Some(vec![NodeId(1)]),
        };
        assert!(matches!(
            rs[1].propose(toggle.clone(), Confidence::FULL),
            Err(GuildError::Rule(_))
        ));

        // A forged proposal that skips local validation is still rejected by vote.
        let forged_id = GuildSync::edit_id_for(&member("a"), RuleVersion(1), &toggle).unwrap();
        let mut clock = VectorClock::new();
        clock.increment(&member("a"));
        rs[1]
            .handle(Envelope::new(
                member("a"),
                GuildName::new("ops").unwrap(),
                clock,
                GuildMessage::Propose {
                    edit_id: forged_id,
                    edit: toggle,
                    base_version: RuleVersion(1),
                    confidence: Confidence::FULL,
                },
            ))
            .unwrap();
        let vote = rs[1].drain_outbox().remove(0).envelope;
        assert_eq!(
            vote.message,
            GuildMessage::Vote {
                edit_id: forged_id,
                outcome: VoteOutcome::Reject
            }
        );
        rs[1].tick().unwrap();
        rs[1].tick().unwrap();
        assert_eq!(rs[1].state(&forged_id), Some(EditState::Rejected));
        assert_eq!(rs[1].version(), RuleVersion(1));
    }

    #[test]
    fn test_stale_peer_unblocks_round() {
        let mut rs = replicas(&[("a", 1), ("b", 1), ("c", 1)]);
        let id = rs[0].propose(define("d1"), Confidence::FULL).unwrap();
        pump(&mut rs, &["c"]);
        assert_eq!(rs[0].version(), RuleVersion(0));
        assert_eq!(rs[0].open_rounds(), 1);

        rs[0].mark_stale(&member("c")).unwrap();
        rs[1].mark_stale(&member("c")).unwrap();
        pump(&mut rs, &["c"]);
        assert_eq!(rs[0].version(), RuleVersion(1));
        assert_eq!(rs[1].state(&id), Some(EditState::Committed));
        assert_eq!(rs[2].version(), RuleVersion(0));
    }

    #[test]
    fn test_disagreeing_commit_is_conflict_unresolved() {
        let mut rs = replicas(&[("a", 1), ("b", 1)]);
        let id = rs[0].propose(define("d1"), Confidence::FULL).unwrap();
        pump(&mut rs, &[]);
        assert_eq!(rs[1].state(&id), Some(EditState::Committed));

        let mut clock = VectorClock::new();
        clock.increment(&member("a"));
        let bogus = Envelope::new(
            member("a"),
            GuildName::new("ops").unwrap(),
            clock,
            GuildMessage::Commit {
                edit_id: id,
                new_version: RuleVersion(1),
            },
        );
        assert!(rs[1].handle(bogus).is_ok());

        let rejected = rs[1].propose(define("d1"), Confidence::FULL);
        assert!(matches!(rejected, Err(GuildError::Rule(_))));

        let loser = rs[1].propose(define("d2"), Confidence::ZERO).unwrap();
        rs[0].propose(define("d3"), Confidence::FULL).unwrap();
        pump(&mut rs, &[]);
        assert_eq!(rs[1].state(&loser), Some(EditState::Rejected));

        let mut clock = VectorClock::new();
        clock.increment(&member("a"));
        let disagreeing = Envelope::new(
            member("a"),
            GuildName::new("ops").unwrap(),
            clock,
            GuildMessage::Commit {
                edit_id: loser,
                new_version: RuleVersion(2),
            },
        );
        assert!(matches!(
            rs[1].handle(disagreeing),
            Err(GuildError::ConflictUnresolved { .. })
        ));
    }

    #[test]
    fn test_final_states_trimmed_beyond_history() {
        let guild = guild(&[("a", 1), ("b", 1)]);
        let config = SyncConfig::default().with_history(1);
        let mut rs: Vec<GuildSync> = ["a", "b"]
            .iter()
            .map(|m| GuildSync::new(member(m), guild.clone(), graph(), config.clone()).unwrap())
            .collect();

        let mut contested = Vec::new();
        for n in 0..5 {
            let winner = rs[0].propose(define(&format!("w{n}")), Confidence::FULL).unwrap();
            let loser = rs[1].propose(define(&format!("l{n}")), Confidence::ZERO).unwrap();
            contested.push((winner, loser));
            pump(&mut rs, &[]);
        }

        let (first, first_loser) = contested[0];
        let (last, last_loser) = contested[4];
        for r in &rs {
            assert_eq!(r.version(), RuleVersion(5));
            assert!(r.tracked_edits() <= 4, "{} tracks {}", r.member(), r.tracked_edits());
            assert_eq!(r.state(&first), Some(EditState::Committed));
            assert_eq!(r.state(&first_loser), None);
            assert_eq!(r.state(&last), Some(EditState::Committed));
            assert_eq!(r.state(&last_loser), Some(EditState::Rejected));
        }
        assert_eq!(rs[1].rebase_for(&first_loser), None);
        assert_eq!(rs[1].rebase_for(&last_loser), Some(RuleVersion(5)));

        let mut clock = VectorClock::new();
        clock.increment(&member("a"));
        rs[1]
            .handle(Envelope::new(
                member("a"),
                GuildName::new("ops").unwrap(),
                clock,
                GuildMessage::Commit {
                    edit_id: first,
                    new_version: RuleVersion(1),
                },
            ))
            .unwrap();
        assert_eq!(rs[1].version(), RuleVersion(5));
        assert_eq!(rs[1].log().len(), 5);
    }

    #[test]
    fn test_foreign_sender_refused() {
        let mut rs = replicas(&[("a", 1), ("b", 1)]);
        let env = Envelope::new(
            member("mallory"),
            GuildName::new("ops").unwrap(),
            VectorClock::new(),
            GuildMessage::Vote {
                edit_id: EditId::new(),
                outcome: VoteOutcome::Accept,
            },
        );
        assert!(matches!(rs[0].handle(env), Err(GuildError::NotMember { .. })));
    }

    #[test]
    fn test_replica_resumes_from_log() {
        let mut rs = replicas(&[("a", 1), ("b", 1)]);
        advance_to(&mut rs, 3);
        let resumed = GuildSync::from_log(
            member("a"),
            rs[0].guild().clone(),
            graph(),
            rs[0].log().clone(),
            SyncConfig::default(),
        )
        .unwrap();
        assert_eq!(resumed.version(), RuleVersion(3));
        assert_eq!(
            resumed.rules().fingerprint().unwrap(),
            rs[1].rules().fingerprint().unwrap()
        );
    }
}
