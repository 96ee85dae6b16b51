//! Deterministic conflict resolution.
//!
//! Candidates are ranked by confidence, then guild priority, then member
//! identity (smaller wins), then edit id. The ranking is a total order
//! over candidates, so every member picks the same winner from the same
//! candidate set no matter which order the proposals arrived in.

use celarion_core::{EditId, MemberId, RuleVersion};
use celarion_proof::Confidence;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One candidate as seen at resolution time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contender {
    /// Edit
    pub edit_id: EditId,
    /// Author
    pub author: MemberId,
    /// Author's confidence
    pub confidence: Confidence,
    /// Author's guild priority
    pub priority: u32,
    /// Every live member accepted the candidate
    pub eligible: bool,
}

impl Contender {
    /// Ranking; `Ordering::Less` means `self` beats `other`
    #[must_use]
    pub fn rank(&self, other: &Self) -> Ordering {
        other
            .eligible
            .cmp(&self.eligible)
            .then_with(|| other.confidence.cmp(&self.confidence))
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.author.cmp(&other.author))
            .then_with(|| self.edit_id.cmp(&other.edit_id))
    }
}

/// Record of a round that had more than one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Base version the candidates shared
    pub base: RuleVersion,
    /// Every candidate, best first
    pub contenders: Vec<Contender>,
    /// Winning edit, if any candidate was eligible
    pub winner: Option<EditId>,
    /// Rejected edits
    pub losers: Vec<EditId>,
}

impl ConflictRecord {
    /// Rank `contenders` and pick the winner
    #[must_use]
    pub fn resolve(base: RuleVersion, mut contenders: Vec<Contender>) -> Self {
        contenders.sort_by(Contender::rank);
        let winner = contenders
            .first()
            .filter(|c| c.eligible)
            .map(|c| c.edit_id);
        let losers = contenders
            .iter()
            .map(|c| c.edit_id)
            .filter(|id| Some(*id) != winner)
            .collect();
        Self {
            base,
            contenders,
            winner,
            losers,
        }
    }

    /// True if more than one candidate competed
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.contenders.len() > 1
    }
}
