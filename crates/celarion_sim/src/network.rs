//! Simulated guild network.
//!
//! Envelopes queue per link (sender, recipient) and each link is FIFO, as
//! the real transports are. Each step picks one non-empty link at random
//! from the seeded RNG, so a seed names one interleaving. A lost envelope
//! stays at the head of its link and is retransmitted. Envelopes to or
//! from a cut member fail, counting attempts toward the sender's retry
//! budget.

use crate::seed::SimSeed;
use celarion_core::MemberId;
use celarion_guild::{Envelope, Outgoing};
use indexmap::{IndexMap, IndexSet};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fault settings for the simulated network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConditions {
    /// Chance per delivery, in thousandths, that the envelope is lost and retransmitted
    pub loss_per_mille: u16,
    /// Chance per delivery, in thousandths, that the envelope is delivered twice
    pub duplicate_per_mille: u16,
    /// Members nobody can reach
    pub cut: IndexSet<MemberId>,
}

impl NetworkConditions {
    /// Lossless network with no duplicates
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set loss rate
    #[must_use]
    pub fn with_loss(mut self, per_mille: u16) -> Self {
        self.loss_per_mille = per_mille.min(1000);
        self
    }

    /// Set duplicate rate
    #[must_use]
    pub fn with_duplicates(mut self, per_mille: u16) -> Self {
        self.duplicate_per_mille = per_mille.min(1000);
        self
    }

    /// Cut a member off the network
    #[must_use]
    pub fn with_cut(mut self, member: MemberId) -> Self {
        self.cut.insert(member);
        self
    }

    /// True if `from` can reach `to`
    #[must_use]
    pub fn can_reach(&self, from: &MemberId, to: &MemberId) -> bool {
        !self.cut.contains(from) && !self.cut.contains(to)
    }
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            loss_per_mille: 0,
            duplicate_per_mille: 0,
            cut: IndexSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    envelope: Envelope,
    attempts: u32,
    duplicated: bool,
}

/// Result of one network step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Hand the envelope to `to`
    Deliver {
        /// Recipient
        to: MemberId,
        /// Envelope
        envelope: Envelope,
        /// True for a redelivered copy
        duplicate: bool,
    },
    /// The envelope was lost and queued again
    Lost {
        /// Sender
        from: MemberId,
        /// Recipient
        to: MemberId,
    },
    /// Delivery to an unreachable member failed
    Failed {
        /// Sender
        from: MemberId,
        /// Recipient
        to: MemberId,
        /// Attempts made so far, this one included
        attempts: u32,
    },
}

/// Pool of envelopes in flight
#[derive(Debug)]
pub struct SimNetwork {
    rng: ChaCha8Rng,
    conditions: NetworkConditions,
    links: IndexMap<(MemberId, MemberId), VecDeque<InFlight>>,
    max_attempts: u32,
}

impl SimNetwork {
    /// Create a network; failed sends are retried until `max_attempts`
    #[must_use]
    pub fn new(seed: &SimSeed, conditions: NetworkConditions, max_attempts: u32) -> Self {
        Self {
            rng: seed.derive("network").rng(),
            conditions,
            links: IndexMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Current fault settings
    #[must_use]
    pub fn conditions(&self) -> &NetworkConditions {
        &self.conditions
    }

    /// Queue every recipient of an outgoing envelope
    pub fn submit(&mut self, outgoing: Outgoing) {
        let from = outgoing.envelope.sender.clone();
        for to in outgoing.to {
            self.links
                .entry((from.clone(), to))
                .or_default()
                .push_back(InFlight {
                    envelope: outgoing.envelope.clone(),
                    attempts: 0,
                    duplicated: false,
                });
        }
    }

    /// Envelopes still in flight
    #[must_use]
    pub fn pending(&self) -> usize {
        self.links.values().map(VecDeque::len).sum()
    }

    /// True if nothing is in flight
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.links.values().all(VecDeque::is_empty)
    }

    /// Pick one link at random and try to deliver its head envelope
    pub fn step(&mut self) -> Option<Delivery> {
        let ready: Vec<usize> = self
            .links
            .values()
            .enumerate()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(i, _)| i)
            .collect();
        if ready.is_empty() {
            return None;
        }
        let pick = ready[self.rng.gen_range(0..ready.len())];
        let reachable = {
            let ((from, to), _) = self.links.get_index(pick)?;
            self.conditions.can_reach(from, to)
        };
        let lost = reachable && self.roll(self.conditions.loss_per_mille);
        let duplicate_roll = self.roll(self.conditions.duplicate_per_mille);
        let max_attempts = self.max_attempts;

        let ((from, to), queue) = self.links.get_index_mut(pick)?;
        let (from, to) = (from.clone(), to.clone());

        if !reachable {
            let head = queue.front_mut()?;
            head.attempts += 1;
            let attempts = head.attempts;
            if attempts >= max_attempts {
                queue.pop_front();
            }
            return Some(Delivery::Failed { from, to, attempts });
        }
        if lost {
            return Some(Delivery::Lost { from, to });
        }

        let flight = queue.pop_front()?;
        if !flight.duplicated && duplicate_roll {
            let mut copy = flight.clone();
            copy.duplicated = true;
            queue.push_back(copy);
        }
        Some(Delivery::Deliver {
            to,
            envelope: flight.envelope,
            duplicate: flight.duplicated,
        })
    }

    /// Roll against a per-mille chance
    pub fn roll(&mut self, per_mille: u16) -> bool {
        per_mille > 0 && self.rng.gen_range(0..1000) < u32::from(per_mille)
    }
}
