//! Append-only log of committed edits.
//!
//! Each entry's hash covers its predecessor's hash and its own canonical
//! encoding, so any rewrite of history breaks the chain. Replaying the
//! log over the same graph reconstructs the rule set.

use crate::edit::RuleEdit;
use crate::ruleset::{RuleError, RuleSet};
use celarion_core::{
    CanonicalDecoder, CanonicalEncode, CanonicalEncoder, CoreError, EditId, Hash, MemberId,
    RuleVersion,
};
use celarion_graph::StreamGraph;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, error};

/// Log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// A version was committed twice; the store can no longer be trusted
    #[error("Version {version} committed twice")]
    DoubleCommit {
        /// Version seen again
        version: RuleVersion,
    },

    /// Entry skips a version
    #[error("Version gap: expected {expected}, got {actual}")]
    VersionGap {
        /// Next version the log expected
        expected: RuleVersion,
        /// Version offered
        actual: RuleVersion,
    },

    /// Hash chain broken
    #[error("Broken hash chain at entry {position}")]
    BrokenChain {
        /// Index of the first bad entry
        position: usize,
    },

    /// Encoding failure
    #[error("Log encoding error: {0}")]
    Encoding(String),

    /// Entry does not apply during replay
    #[error("Replay of {version} failed: {source}")]
    Replay {
        /// Entry version
        version: RuleVersion,
        /// Why the edit failed
        source: RuleError,
    },
}

impl From<LogError> for CoreError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::BrokenChain { position } => CoreError::BrokenChain { position },
            LogError::Encoding(_) => CoreError::InvalidEncoding,
            other => CoreError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Hashed portion of an entry
#[derive(Serialize)]
struct EntryBody<'a> {
    version: RuleVersion,
    edit_id: EditId,
    author: &'a MemberId,
    edit: &'a RuleEdit,
}

impl CanonicalEncode for EntryBody<'_> {}

/// One committed edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Version this edit produced
    pub version: RuleVersion,
    /// Idempotency key of the edit
    pub edit_id: EditId,
    /// Member that proposed it
    pub author: MemberId,
    /// The edit
    pub edit: RuleEdit,
    /// Hash of the previous entry
    pub prev: Hash,
    /// Hash of this entry
    pub hash: Hash,
}

impl CanonicalEncode for LogEntry {}

impl LogEntry {
    fn compute_hash(
        prev: &Hash,
        version: RuleVersion,
        edit_id: EditId,
        author: &MemberId,
        edit: &RuleEdit,
    ) -> Result<Hash, LogError> {
        let body = EntryBody {
            version,
            edit_id,
            author,
            edit,
        }
        .encode()
        .map_err(|e| LogError::Encoding(e.to_string()))?;
        Ok(prev.chain(&body))
    }

    /// True if `hash` matches `prev` and the contents
    ///
    /// # Errors
    ///
    /// Returns error if the entry cannot be encoded
    pub fn verify(&self) -> Result<bool, LogError> {
        let expected =
            Self::compute_hash(&self.prev, self.version, self.edit_id, &self.author, &self.edit)?;
        Ok(expected == self.hash)
    }
}

/// Append-only, hash-chained log of committed edits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleLog {
    entries: Vec<LogEntry>,
}

impl RuleLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of the last entry, genesis when empty
    #[must_use]
    pub fn tip(&self) -> Hash {
        self.entries.last().map_or(Hash::genesis(), |e| e.hash)
    }

    /// Highest committed version
    #[must_use]
    pub fn head(&self) -> RuleVersion {
        self.entries
            .last()
            .map_or(RuleVersion::INITIAL, |e| e.version)
    }

    /// Entries in commit order
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was committed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if `edit_id` was committed
    #[must_use]
    pub fn contains(&self, edit_id: &EditId) -> bool {
        self.entries.iter().any(|e| &e.edit_id == edit_id)
    }

    /// Append a committed edit
    ///
    /// # Errors
    ///
    /// Returns `DoubleCommit` if `version` is already in the log, which
    /// callers must treat as fatal, or `VersionGap` if it skips ahead
    pub fn append(
        &mut self,
        version: RuleVersion,
        edit_id: EditId,
        author: MemberId,
        edit: RuleEdit,
    ) -> Result<&LogEntry, LogError> {
        let expected = self.head().next();
        if version < expected {
            error!(%version, head = %self.head(), "double commit");
            return Err(LogError::DoubleCommit { version });
        }
        if version > expected {
            return Err(LogError::VersionGap {
                expected,
                actual: version,
            });
        }

        let prev = self.tip();
        let hash = LogEntry::compute_hash(&prev, version, edit_id, &author, &edit)?;
        debug!(%version, %edit_id, hash = %hash.short(), "log entry appended");
        self.entries.push(LogEntry {
            version,
            edit_id,
            author,
            edit,
            prev,
            hash,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Check every link and version step
    ///
    /// # Errors
    ///
    /// Returns `BrokenChain` at the first entry that does not link
    pub fn verify(&self) -> Result<(), LogError> {
        let mut prev = Hash::genesis();
        let mut version = RuleVersion::INITIAL;
        for (position, entry) in self.entries.iter().enumerate() {
            if entry.prev != prev || entry.version != version.next() || !entry.verify()? {
                return Err(LogError::BrokenChain { position });
            }
            prev = entry.hash;
            version = entry.version;
        }
        Ok(())
    }

    /// Rebuild the rule set by applying every entry in order
    ///
    /// # Errors
    ///
    /// Returns error if the chain is broken or an edit does not apply
    pub fn replay(&self, graph: Arc<StreamGraph>) -> Result<RuleSet, LogError> {
        self.verify()?;
        let mut rules = RuleSet::new(graph);
        for entry in &self.entries {
            let version = rules.apply(&entry.edit).map_err(|source| LogError::Replay {
                version: entry.version,
                source,
            })?;
            if version != entry.version {
                return Err(LogError::VersionGap {
                    expected: version,
                    actual: entry.version,
                });
            }
        }
        Ok(rules)
    }

    /// Write every entry as length-prefixed postcard frames
    ///
    /// # Errors
    ///
    /// Returns error if encoding or writing fails
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), LogError> {
        let mut encoder = CanonicalEncoder::new(writer);
        for entry in &self.entries {
            encoder
                .encode(entry)
                .map_err(|e| LogError::Encoding(e.to_string()))?;
        }
        encoder
            .flush()
            .map_err(|e| LogError::Encoding(e.to_string()))
    }

    /// Read a log written by [`RuleLog::write_to`] and verify it
    ///
    /// # Errors
    ///
    /// Returns error if a frame is malformed or the chain is broken
    pub fn read_from<R: Read>(reader: R) -> Result<Self, LogError> {
        let mut decoder = CanonicalDecoder::new(reader);
        let mut entries = Vec::new();
        while let Some(entry) = decoder
            .decode::<LogEntry>()
            .map_err(|e| LogError::Encoding(e.to_string()))?
        {
            entries.push(entry);
        }
        let log = Self { entries };
        log.verify()?;
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Directive;
    use celarion_core::{DirectiveId, NodeId};
    use celarion_graph::StreamNode;
    use celarion_proof::ProofChain;

    fn graph() -> Arc<StreamGraph> {
        Arc::new(StreamGraph::from_parts(vec![StreamNode::terminal(0)], vec![]).unwrap())
    }

    fn author() -> MemberId {
        MemberId::new("alpha").unwrap()
    }

    fn define(name: &str) -> RuleEdit {
        RuleEdit::Define(Directive::new(
            DirectiveId::new(name).unwrap(),
            ProofChain::new(),
            vec![NodeId(0)],
        ))
    }

    fn sample_log() -> RuleLog {
        let mut log = RuleLog::new();
        log.append(RuleVersion(1), EditId::new(), author(), define("a"))
            .unwrap();
        log.append(RuleVersion(2), EditId::new(), author(), define("b"))
            .unwrap();
        log.append(
            RuleVersion(3),
            EditId::new(),
            author(),
            RuleEdit::Deprecate {
                id: DirectiveId::new("a").unwrap(),
                reason: "retired".into(),
            },
        )
        .unwrap();
        log
    }

    #[test]
    fn test_double_commit_detected() {
        let mut log = sample_log();
        let err = log
            .append(RuleVersion(2), EditId::new(), author(), define("c"))
            .unwrap_err();
        assert_eq!(err, LogError::DoubleCommit { version: RuleVersion(2) });

        let gap = log
            .append(RuleVersion(9), EditId::new(), author(), define("c"))
            .unwrap_err();
        assert!(matches!(gap, LogError::VersionGap { .. }));
    }

    #[test]
    fn test_replay_matches_live_state() {
        let g = graph();
        let log = sample_log();
        let mut live = RuleSet::new(Arc::clone(&g));
        for entry in log.entries() {
            live.apply(&entry.edit).unwrap();
        }
        let replayed = log.replay(g).unwrap();
        assert_eq!(replayed.version(), RuleVersion(3));
        assert_eq!(replayed.snapshot(), live.snapshot());
        assert_eq!(replayed.directives().count(), 2);
    }

    #[test]
    fn test_tampering_breaks_chain() {
        let mut log = sample_log();
        log.entries[1].edit = define("evil");
        assert_eq!(log.verify(), Err(LogError::BrokenChain { position: 1 }));
    }

    #[test]
    fn test_persisted_log_roundtrip() {
        let log = sample_log();
        let mut bytes = Vec::new();
        log.write_to(&mut bytes).unwrap();

        let restored = RuleLog::read_from(&bytes[..]).unwrap();
        assert_eq!(restored, log);
        assert_eq!(restored.tip(), log.tip());
    }

    #[test]
    fn test_replay_rejects_invalid_edit() {
        let mut log = RuleLog::new();
        log.append(
            RuleVersion(1),
            EditId::new(),
            author(),
            RuleEdit::Freeze {
                id: DirectiveId::new("ghost").unwrap(),
            },
        )
        .unwrap();
        assert!(matches!(
            log.replay(graph()),
            Err(LogError::Replay { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_replay_equals_live(ops in proptest::collection::vec((0u8..3, 0u8..4), 0..24)) {
            let g = graph();
            let mut live = RuleSet::new(Arc::clone(&g));
            let mut log = RuleLog::new();
            for (kind, slot) in ops {
                let id = DirectiveId::new(format!("d{slot}")).unwrap();
                let edit = match kind {
                    0 => define(id.as_str()),
                    1 => RuleEdit::Freeze { id },
                    _ => RuleEdit::Deprecate { id, reason: "retired".into() },
                };
                if let Ok(version) = live.apply(&edit) {
                    log.append(version, EditId::new(), author(), edit).unwrap();
                }
            }

            let mut bytes = Vec::new();
            log.write_to(&mut bytes).unwrap();
            let restored = RuleLog::read_from(&bytes[..]).unwrap();
            let replayed = restored.replay(g).unwrap();
            proptest::prop_assert_eq!(replayed.snapshot(), live.snapshot());
            proptest::prop_assert_eq!(replayed.fingerprint().unwrap(), live.fingerprint().unwrap());
        }
    }
}
