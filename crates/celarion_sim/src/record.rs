//! Recording of simulation runs.

use crate::seed::SimSeed;
use celarion_core::{EditId, MemberId};
use serde::{Deserialize, Serialize};

/// One observable simulation event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimEvent {
    /// A member proposed an edit
    Proposed {
        /// Author
        member: MemberId,
        /// Edit
        edit_id: EditId,
    },
    /// An envelope reached its recipient
    Delivered {
        /// Sender
        from: MemberId,
        /// Recipient
        to: MemberId,
        /// Message kind
        kind: String,
        /// Edit the message concerns
        edit_id: EditId,
        /// True for a redelivered copy
        duplicate: bool,
    },
    /// An envelope was lost and queued again
    Lost {
        /// Sender
        from: MemberId,
        /// Recipient
        to: MemberId,
    },
    /// A send to an unreachable member failed
    Failed {
        /// Sender
        from: MemberId,
        /// Recipient
        to: MemberId,
        /// Attempts so far
        attempts: u32,
    },
    /// A member stopped waiting for a peer
    Stale {
        /// Member that gave up
        member: MemberId,
        /// Peer given up on
        peer: MemberId,
    },
    /// A member advanced logical time
    Tick {
        /// Member
        member: MemberId,
    },
}

impl SimEvent {
    /// Member the event happened on
    #[must_use]
    pub fn member(&self) -> &MemberId {
        match self {
            Self::Proposed { member, .. } | Self::Stale { member, .. } | Self::Tick { member } => {
                member
            }
            Self::Delivered { to, .. } => to,
            Self::Lost { from, .. } | Self::Failed { from, .. } => from,
        }
    }
}

/// Ordered event log of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRecord {
    /// Seed of the run
    pub seed: SimSeed,
    /// Events keyed by step
    pub events: Vec<(u64, SimEvent)>,
}

impl SimRecord {
    /// Create an empty record for `seed`
    #[must_use]
    pub fn new(seed: SimSeed) -> Self {
        Self {
            seed,
            events: Vec::new(),
        }
    }

    /// Append an event
    pub fn push(&mut self, step: u64, event: SimEvent) {
        self.events.push((step, event));
    }

    /// Number of events
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Events that happened on one member
    #[must_use]
    pub fn events_for(&self, member: &MemberId) -> Vec<&SimEvent> {
        self.events
            .iter()
            .filter(|(_, e)| e.member() == member)
            .map(|(_, e)| e)
            .collect()
    }

    /// Serialize to JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
