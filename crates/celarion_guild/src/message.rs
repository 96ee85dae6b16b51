//! GuildSync wire messages.
//!
//! Every message travels inside an [`Envelope`] naming its sender, guild
//! and vector clock. Envelopes are postcard-encoded and framed with a
//! length prefix on the wire. Delivery is at-least-once, so every
//! message is idempotent by edit id.

use crate::error::TransportError;
use celarion_core::{
    decode, CanonicalEncode, EditId, GuildName, MemberId, RuleVersion, VectorClock,
};
use celarion_proof::Confidence;
use celarion_rules::RuleEdit;
use serde::{Deserialize, Serialize};

/// A member's vote on one candidate edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    /// Base matched and the edit validates
    Accept,
    /// Late base or the edit fails validation
    Reject,
}

impl VoteOutcome {
    /// True for `Accept`
    #[must_use]
    pub const fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// GuildSync messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuildMessage {
    /// A new edit made against `base_version`
    Propose {
        /// Idempotency key
        edit_id: EditId,
        /// The edit
        edit: RuleEdit,
        /// Version the author saw
        base_version: RuleVersion,
        /// Author's confidence in the edit
        confidence: Confidence,
    },
    /// Acknowledgement of a candidate
    Vote {
        /// Candidate voted on
        edit_id: EditId,
        /// Outcome
        outcome: VoteOutcome,
    },
    /// The sender committed an edit
    Commit {
        /// Committed edit
        edit_id: EditId,
        /// Version the commit produced
        new_version: RuleVersion,
    },
    /// The edit was rejected; its author should rebase
    Rebase {
        /// Rejected edit
        edit_id: EditId,
        /// Version to rebase onto
        new_base_version: RuleVersion,
    },
}

impl GuildMessage {
    /// Edit the message is about
    #[must_use]
    pub fn edit_id(&self) -> EditId {
        match self {
            Self::Propose { edit_id, .. }
            | Self::Vote { edit_id, .. }
            | Self::Commit { edit_id, .. }
            | Self::Rebase { edit_id, .. } => *edit_id,
        }
    }

    /// Short name for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Propose { .. } => "propose",
            Self::Vote { .. } => "vote",
            Self::Commit { .. } => "commit",
            Self::Rebase { .. } => "rebase",
        }
    }
}

/// A message with its routing header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending member
    pub sender: MemberId,
    /// Guild the message belongs to
    pub guild: GuildName,
    /// Sender's clock at send time
    pub clock: VectorClock,
    /// Payload
    pub message: GuildMessage,
}

impl CanonicalEncode for Envelope {}

impl Envelope {
    /// Wrap a message
    #[must_use]
    pub fn new(sender: MemberId, guild: GuildName, clock: VectorClock, message: GuildMessage) -> Self {
        Self {
            sender,
            guild,
            clock,
            message,
        }
    }

    /// Encode for the wire
    ///
    /// # Errors
    ///
    /// Returns `Encoding` if the envelope cannot be encoded
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        self.encode()
            .map_err(|e| TransportError::Encoding(e.to_string()))
    }

    /// Decode from the wire
    ///
    /// # Errors
    ///
    /// Returns `Encoding` if the bytes are not an envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        decode(bytes).map_err(|e| TransportError::Encoding(e.to_string()))
    }
}
