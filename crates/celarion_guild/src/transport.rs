//! Peer transports.
//!
//! [`PeerTransport`] is the seam between a member and its peers. The
//! in-memory implementation routes length-prefixed postcard frames
//! through tokio channels and can cut members off to exercise the
//! unreachable-peer path.

use crate::error::TransportError;
use crate::message::Envelope;
use async_trait::async_trait;
use celarion_core::{CanonicalDecoder, CanonicalEncoder, MemberId};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Sends envelopes to peers and receives envelopes addressed to this member
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Member this endpoint belongs to
    fn local(&self) -> &MemberId;

    /// Deliver one envelope to `to`
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the peer cannot be reached
    async fn send(&self, to: &MemberId, envelope: &Envelope) -> Result<(), TransportError>;

    /// Next envelope for this member; `None` once the transport is closed
    async fn recv(&self) -> Option<Envelope>;
}

#[derive(Debug)]
struct Link {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    connected: bool,
}

/// In-process network connecting [`MemoryTransport`] endpoints
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    links: Arc<Mutex<IndexMap<MemberId, Link>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the endpoint for `member`, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the network lock is poisoned
    pub fn endpoint(&self, member: MemberId) -> Result<MemoryTransport, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.links
            .lock()
            .map_err(|_| TransportError::Closed)?
            .insert(
                member.clone(),
                Link {
                    sender,
                    connected: true,
                },
            );
        Ok(MemoryTransport {
            member,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(receiver),
        })
    }

    /// Cut `member` off; sends to and from it fail until reconnected
    pub fn disconnect(&self, member: &MemberId) {
        self.set_connected(member, false);
    }

    /// Restore `member`
    pub fn reconnect(&self, member: &MemberId) {
        self.set_connected(member, true);
    }

    fn set_connected(&self, member: &MemberId, connected: bool) {
        match self.links.lock() {
            Ok(mut links) => {
                if let Some(link) = links.get_mut(member) {
                    link.connected = connected;
                }
            }
            Err(_) => warn!(%member, "network lock poisoned"),
        }
    }

    fn deliver(&self, from: &MemberId, to: &MemberId, frame: Vec<u8>) -> Result<(), TransportError> {
        let links = self.links.lock().map_err(|_| TransportError::Closed)?;
        let sender_up = links.get(from).is_some_and(|l| l.connected);
        let Some(link) = links.get(to).filter(|l| l.connected && sender_up) else {
            return Err(TransportError::Unreachable(to.clone()));
        };
        link.sender
            .send(frame)
            .map_err(|_| TransportError::Unreachable(to.clone()))
    }
}

/// One member's endpoint on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    member: MemberId,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local(&self) -> &MemberId {
        &self.member
    }

    async fn send(&self, to: &MemberId, envelope: &Envelope) -> Result<(), TransportError> {
        let mut encoder = CanonicalEncoder::new(Vec::new());
        encoder
            .encode(envelope)
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        trace!(from = %self.member, %to, kind = envelope.message.kind(), "frame sent");
        self.network.deliver(&self.member, to, encoder.into_inner())
    }

    async fn recv(&self) -> Option<Envelope> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let frame = inbox.recv().await?;
            let mut decoder = CanonicalDecoder::new(frame.as_slice());
            match decoder.decode::<Envelope>() {
                Ok(Some(envelope)) => return Some(envelope),
                Ok(None) => continue,
                Err(err) => warn!(member = %self.member, %err, "dropping malformed frame"),
            }
        }
    }
}
