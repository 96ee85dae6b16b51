//! GuildSync coordination over a transport.
//!
//! The coordinator owns the receive loop for one member. Inbound envelopes
//! are routed to the replica of their guild; each replica's outbox is
//! fanned out to one link task per peer. A link retries with exponential
//! backoff under a round-trip deadline and reports the peer unreachable
//! once its attempts run out, at which point every replica marks it stale.

use crate::config::RetryPolicy;
use crate::error::{GuildError, TransportError};
use crate::message::Envelope;
use crate::sync::GuildSync;
use crate::transport::PeerTransport;
use celarion_core::{ExitCode, GuildName, MemberId};
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Summary of a coordinator run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorReport {
    /// Envelopes handled
    pub received: u64,
    /// Envelopes handed to links
    pub sent: u64,
    /// Peers marked stale during the run
    pub stale: Vec<MemberId>,
    /// Non-fatal protocol errors surfaced during the run
    pub errors: Vec<GuildError>,
}

impl CoordinatorReport {
    /// Exit code summarizing the run
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        self.errors
            .iter()
            .fold(ExitCode::Success, |code, err| code.worst(err.exit_code()))
    }
}

#[derive(Debug)]
enum LinkEvent {
    Unreachable(MemberId),
}

/// Drives the replicas of one member over a transport
pub struct GuildCoordinator {
    replicas: IndexMap<GuildName, Arc<Mutex<GuildSync>>>,
    transport: Arc<dyn PeerTransport>,
    policy: RetryPolicy,
    tick_interval: Duration,
}

impl std::fmt::Debug for GuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildCoordinator")
            .field("member", self.transport.local())
            .field("guilds", &self.replicas.keys().collect::<Vec<_>>())
            .field("policy", &self.policy)
            .finish()
    }
}

impl GuildCoordinator {
    /// Create a coordinator
    #[must_use]
    pub fn new(transport: Arc<dyn PeerTransport>, policy: RetryPolicy) -> Self {
        Self {
            replicas: IndexMap::new(),
            transport,
            policy,
            tick_interval: Duration::from_millis(10),
        }
    }

    /// Route a guild's envelopes to `replica`
    #[must_use]
    pub fn with_replica(mut self, replica: Arc<Mutex<GuildSync>>, guild: GuildName) -> Self {
        self.replicas.insert(guild, replica);
        self
    }

    /// Set how often replicas advance logical time
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Run until `cancel` fires or the transport closes
    ///
    /// # Errors
    ///
    /// Returns `StoreCorruption` as soon as any replica reports it; the
    /// member must stop
    #[instrument(skip_all, fields(member = %self.transport.local()))]
    pub async fn run(self, cancel: CancellationToken) -> Result<CoordinatorReport, GuildError> {
        let mut peers: Vec<MemberId> = Vec::new();
        for replica in self.replicas.values() {
            let sync = replica.lock().await;
            for peer in sync.guild().peers_of(sync.member()) {
                if !peers.contains(peer) {
                    peers.push(peer.clone());
                }
            }
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut links: IndexMap<MemberId, mpsc::UnboundedSender<Envelope>> = IndexMap::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for peer in peers {
            let (tx, rx) = mpsc::unbounded_channel();
            tasks.push(tokio::spawn(link_task(
                peer.clone(),
                Arc::clone(&self.transport),
                self.policy.clone(),
                rx,
                events_tx.clone(),
            )));
            links.insert(peer, tx);
        }
        drop(events_tx);
        info!(links = links.len(), guilds = self.replicas.len(), "coordinator started");

        let mut report = CoordinatorReport::default();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => break Ok(()),
                Some(event) = events_rx.recv() => self.on_link_event(event, &mut report).await,
                received = self.transport.recv() => match received {
                    Some(envelope) => {
                        report.received += 1;
                        self.on_envelope(envelope).await
                    }
                    None => break Ok(()),
                },
                _ = ticker.tick() => self.on_tick().await,
            };

            match step {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    error!(%err, "replica store corrupted, stopping member");
                    break Err(err);
                }
                Err(err @ GuildError::ConflictUnresolved { .. }) => {
                    error!(%err, "conflict unresolved");
                    report.errors.push(err);
                }
                Err(err) => warn!(%err, "envelope refused"),
            }

            report.sent += self.flush(&links).await;
        };

        drop(links);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "link task ended abnormally");
            }
        }
        info!(received = report.received, sent = report.sent, stale = report.stale.len(), "coordinator stopped");
        outcome.map(|()| report)
    }

    async fn on_envelope(&self, envelope: Envelope) -> Result<(), GuildError> {
        let Some(replica) = self.replicas.get(&envelope.guild) else {
            return Err(GuildError::UnknownGuild(envelope.guild));
        };
        replica.lock().await.handle(envelope)
    }

    async fn on_tick(&self) -> Result<(), GuildError> {
        for replica in self.replicas.values() {
            replica.lock().await.tick()?;
        }
        Ok(())
    }

    async fn on_link_event(&self, event: LinkEvent, report: &mut CoordinatorReport) -> Result<(), GuildError> {
        match event {
            LinkEvent::Unreachable(peer) => {
                if !report.stale.contains(&peer) {
                    report.stale.push(peer.clone());
                    report.errors.push(GuildError::PeerUnreachable(peer.clone()));
                }
                for replica in self.replicas.values() {
                    replica.lock().await.mark_stale(&peer)?;
                }
                Ok(())
            }
        }
    }

    async fn flush(&self, links: &IndexMap<MemberId, mpsc::UnboundedSender<Envelope>>) -> u64 {
        let mut sent = 0;
        for replica in self.replicas.values() {
            let outgoing = replica.lock().await.drain_outbox();
            for out in outgoing {
                for to in &out.to {
                    match links.get(to) {
                        Some(link) if link.send(out.envelope.clone()).is_ok() => sent += 1,
                        _ => debug!(%to, "no live link, envelope dropped"),
                    }
                }
            }
        }
        sent
    }
}

/// Deliver a peer's envelopes in order, retrying each with backoff
async fn link_task(
    peer: MemberId,
    transport: Arc<dyn PeerTransport>,
    policy: RetryPolicy,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut reported = false;
    while let Some(envelope) = queue.recv().await {
        if reported {
            continue;
        }
        if let Err(err) = send_with_retry(transport.as_ref(), &peer, &envelope, &policy).await {
            warn!(%peer, %err, attempts = policy.max_attempts, "peer unreachable");
            reported = true;
            if events.send(LinkEvent::Unreachable(peer.clone())).is_err() {
                return;
            }
        }
    }
}

/// Send one envelope, retrying with exponential backoff
///
/// # Errors
///
/// Returns the last transport error once every attempt failed
pub async fn send_with_retry(
    transport: &dyn PeerTransport,
    peer: &MemberId,
    envelope: &Envelope,
    policy: &RetryPolicy,
) -> Result<(), TransportError> {
    let attempts = policy.max_attempts.max(1);
    let mut last = TransportError::Unreachable(peer.clone());
    for attempt in 1..=attempts {
        let sent = tokio::time::timeout(policy.round_trip_deadline(), transport.send(peer, envelope)).await;
        match sent {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => last = err,
            Err(_) => last = TransportError::Timeout(policy.round_trip_deadline_ms),
        }
        if attempt < attempts {
            let backoff = policy.backoff(attempt);
            debug!(%peer, attempt, backoff_ms = backoff.as_millis() as u64, "retrying peer");
            tokio::time::sleep(backoff).await;
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::membership::Guild;
    use crate::sync::tests::{define, graph};
    use crate::sync::EditState;
    use crate::transport::MemoryNetwork;
    use celarion_core::RuleVersion;
    use celarion_proof::Confidence;

    fn member(name: &str) -> MemberId {
        MemberId::new(name).unwrap()
    }

    fn guild() -> Guild {
        Guild::new(GuildName::new("ops").unwrap())
            .with_member(member("a"), 1)
            .with_member(member("b"), 1)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_initial_backoff(Duration::from_millis(1))
            .with_max_attempts(2)
            .with_round_trip_deadline(Duration::from_millis(50))
    }

    fn replica(name: &str) -> Arc<Mutex<GuildSync>> {
        Arc::new(Mutex::new(
            GuildSync::new(member(name), guild(), graph(), SyncConfig::default()).unwrap(),
        ))
    }

    async fn wait_for_version(replica: &Arc<Mutex<GuildSync>>, version: u64) {
        for _ in 0..200 {
            if replica.lock().await.version() == RuleVersion(version) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_two_members_commit_over_memory_transport() {
        let net = MemoryNetwork::new();
        let ops = GuildName::new("ops").unwrap();
        let (ra, rb) = (replica("a"), replica("b"));
        let cancel = CancellationToken::new();

        let ca = GuildCoordinator::new(Arc::new(net.endpoint(member("a")).unwrap()), fast_policy())
            .with_replica(Arc::clone(&ra), ops.clone());
        let cb = GuildCoordinator::new(Arc::new(net.endpoint(member("b")).unwrap()), fast_policy())
            .with_replica(Arc::clone(&rb), ops);
        let ha = tokio::spawn(ca.run(cancel.clone()));
        let hb = tokio::spawn(cb.run(cancel.clone()));

        let id = ra.lock().await.propose(define("d1"), Confidence::FULL).unwrap();
        wait_for_version(&ra, 1).await;
        wait_for_version(&rb, 1).await;
        cancel.cancel();

        let report_a = ha.await.unwrap().unwrap();
        let report_b = hb.await.unwrap().unwrap();
        assert_eq!(rb.lock().await.state(&id), Some(EditState::Committed));
        assert!(report_a.sent > 0 && report_b.received > 0);
        assert_eq!(report_a.exit_code(), ExitCode::Success);
    }

    #[tokio::test]
    async fn test_unreachable_peer_marked_stale() {
        let net = MemoryNetwork::new();
        let ops = GuildName::new("ops").unwrap();
        let ra = replica("a");
        let _b = net.endpoint(member("b")).unwrap();
        net.disconnect(&member("b"));
        let cancel = CancellationToken::new();

        let ca = GuildCoordinator::new(Arc::new(net.endpoint(member("a")).unwrap()), fast_policy())
            .with_replica(Arc::clone(&ra), ops);
        let ha = tokio::spawn(ca.run(cancel.clone()));

        ra.lock().await.propose(define("d1"), Confidence::FULL).unwrap();
        wait_for_version(&ra, 1).await;
        cancel.cancel();

        let report = ha.await.unwrap().unwrap();
        assert_eq!(report.stale, vec![member("b")]);
        assert_eq!(report.exit_code(), ExitCode::PeerUnreachable);
        assert!(ra.lock().await.is_stale(&member("b")));
        assert_eq!(ra.lock().await.version(), RuleVersion(1));
    }

    #[tokio::test]
    async fn test_send_with_retry_gives_up() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(member("a")).unwrap();
        let envelope = Envelope::new(
            member("a"),
            GuildName::new("ops").unwrap(),
            celarion_core::VectorClock::new(),
            crate::message::GuildMessage::Rebase {
                edit_id: celarion_core::EditId::new(),
                new_base_version: RuleVersion(1),
            },
        );
        let err = send_with_retry(&a, &member("ghost"), &envelope, &fast_policy())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Unreachable(member("ghost")));
    }
}
