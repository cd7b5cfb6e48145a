//! Read-only verification of a chain snapshot.

use std::collections::BTreeSet;

use serde::Serialize;

use super::{GENESIS_HASH, digest};
use crate::errors::IntegrityFailure;

/// A chain row exactly as stored, before any decoding.
///
/// Verification hashes these column values verbatim, so a rewrite that
/// decodes to the same value (`Z` to `+00:00`) still breaks the entry, and a
/// row that no longer decodes is reported instead of aborting the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub seq: i64,
    pub actor: String,
    pub stage: String,
    pub input_hash: String,
    pub output_hash: String,
    pub prev_hash: String,
    pub verdict: Option<String>,
    pub timestamp: String,
    pub entry_hash: String,
}

impl StoredEntry {
    pub fn compute_hash(&self) -> String {
        digest::entry_hash(&digest::EntryFields {
            prev_hash: &self.prev_hash,
            sequence_no: &self.seq.to_string(),
            actor: &self.actor,
            stage: &self.stage,
            input_hash: &self.input_hash,
            output_hash: &self.output_hash,
            verdict: self.verdict.as_deref(),
            timestamp: &self.timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainIssueKind {
    /// One or more sequence numbers before this entry are missing.
    SequenceGap { expected: u64 },
    /// Recomputing the entry hash does not reproduce the stored one.
    HashMismatch,
    /// `prev_hash` does not equal the stored hash of the preceding entry.
    LinkMismatch,
    /// Entries after the recorded head are missing.
    TruncatedTail { head: u64 },
    /// The last entry does not carry the hash recorded as head.
    HeadMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainIssue {
    pub sequence_no: u64,
    #[serde(flatten)]
    pub kind: ChainIssueKind,
}

/// Outcome of [`verify_entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub valid: bool,
    /// Sorted, de-duplicated sequence numbers of broken entries.
    pub broken: Vec<u64>,
    pub issues: Vec<ChainIssue>,
    pub entries_checked: usize,
}

impl ChainReport {
    pub fn into_result(self) -> Result<Self, IntegrityFailure> {
        if self.valid {
            Ok(self)
        } else {
            Err(IntegrityFailure::ChainBroken {
                broken: self.broken,
            })
        }
    }
}

/// Walk `entries` (in stored order) recomputing every hash and link.
///
/// `head` is the separately stored tail pointer; it lets truncation of the
/// newest entries show up even though no gap remains inside the sequence.
/// A row whose `seq` is negative is reported at the position it occupies.
pub fn verify_entries(entries: &[StoredEntry], head: Option<&(u64, String)>) -> ChainReport {
    let mut issues = Vec::new();
    let mut expected_seq = 1u64;
    let mut expected_prev = GENESIS_HASH;

    for entry in entries {
        let seq = u64::try_from(entry.seq).unwrap_or(expected_seq);
        if entry.seq < 0 || seq != expected_seq {
            issues.push(ChainIssue {
                sequence_no: seq,
                kind: ChainIssueKind::SequenceGap {
                    expected: expected_seq,
                },
            });
        }
        if entry.compute_hash() != entry.entry_hash {
            issues.push(ChainIssue {
                sequence_no: seq,
                kind: ChainIssueKind::HashMismatch,
            });
        }
        if entry.prev_hash != expected_prev {
            issues.push(ChainIssue {
                sequence_no: seq,
                kind: ChainIssueKind::LinkMismatch,
            });
        }
        expected_seq = seq + 1;
        expected_prev = entry.entry_hash.as_str();
    }

    if let Some((head_seq, head_hash)) = head {
        let last = entries.last().map(|e| (u64::try_from(e.seq).unwrap_or(0), &e.entry_hash));
        match last {
            Some((last_seq, _)) if last_seq < *head_seq => issues.push(ChainIssue {
                sequence_no: last_seq + 1,
                kind: ChainIssueKind::TruncatedTail { head: *head_seq },
            }),
            None if *head_seq > 0 => issues.push(ChainIssue {
                sequence_no: 1,
                kind: ChainIssueKind::TruncatedTail { head: *head_seq },
            }),
            Some((last_seq, last_hash)) if last_seq == *head_seq && last_hash != head_hash => {
                issues.push(ChainIssue {
                    sequence_no: last_seq,
                    kind: ChainIssueKind::HeadMismatch,
                })
            }
            _ => {}
        }
    }

    let broken: BTreeSet<u64> = issues.iter().map(|issue| issue.sequence_no).collect();
    ChainReport {
        valid: issues.is_empty(),
        broken: broken.into_iter().collect(),
        issues,
        entries_checked: entries.len(),
    }
}
