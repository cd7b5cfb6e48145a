//! Append-only, hash-linked audit chain.
//!
//! Every component mirrors its state transitions here. Sequencing is owned by
//! this module alone: [`append_in`] reads the tail and writes the next entry
//! inside the caller's transaction, and every transaction is taken under the
//! store's single mutex, so concurrent appends never race on the tail.
//!
//! There is deliberately no repair operation.

pub mod digest;
pub mod verify;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::store::{self, StoreError, StoreHandle};
pub use verify::{ChainIssue, ChainIssueKind, ChainReport, StoredEntry};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Stage labels written by the core.
pub mod stage {
    pub const DECISION_ADD: &str = "decision.add";
    pub const DECISION_CONFIRM: &str = "decision.confirm";
    pub const DECISION_AMEND: &str = "decision.amend";
    pub const DECISION_SUPERSEDE: &str = "decision.supersede";
    pub const CONFLICT_DETECT: &str = "conflict.detect";
    pub const CONFLICT_RESOLVE: &str = "conflict.resolve";
    pub const MILESTONE_ADD: &str = "milestone.add";
    pub const MILESTONE_REVIEW: &str = "milestone.review";
    pub const MILESTONE_ESCALATION: &str = "milestone.escalation";
    pub const MILESTONE_OVERRIDE: &str = "milestone.override";
    pub const TASK_ADD: &str = "task.add";
    pub const TASK_GENERATE: &str = "task.generate";
    pub const TASK_TRANSITION: &str = "task.transition";
    pub const TASK_VERIFICATION: &str = "task.verification";
    pub const TASK_ESCALATION: &str = "task.escalation";
    pub const TASK_OVERRIDE: &str = "task.override";
    pub const REVIEW_INVOCATION: &str = "review.invocation";
    pub const REVIEW_UNAVAILABLE: &str = "review.unavailable";
    pub const REVIEW_AGGREGATE: &str = "review.aggregate";
    pub const FINDING_DEFER: &str = "finding.defer";
    pub const FINDING_RESOLVE: &str = "finding.resolve";
    pub const GRAPH_CHECKPOINT: &str = "graph.checkpoint";
    pub const GRAPH_ROLLBACK: &str = "graph.rollback";
    pub const SESSION_AWAIT: &str = "session.await_input";
    pub const SESSION_RESUME: &str = "session.resume";
    pub const LESSON_RECORD: &str = "lesson.record";
    pub const EVAL_RECORD: &str = "eval.record";
}

/// One stored audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub sequence_no: u64,
    pub actor: String,
    pub stage: String,
    pub input_hash: String,
    pub output_hash: String,
    pub prev_hash: String,
    pub verdict: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub entry_hash: String,
}

impl ChainEntry {
    /// Hash over the fields in the exact text form they are stored in.
    pub fn compute_hash(&self) -> String {
        let timestamp = store::timestamp(&self.timestamp);
        digest::entry_hash(&digest::EntryFields {
            prev_hash: &self.prev_hash,
            sequence_no: &self.sequence_no.to_string(),
            actor: &self.actor,
            stage: &self.stage,
            input_hash: &self.input_hash,
            output_hash: &self.output_hash,
            verdict: self.verdict.as_deref(),
            timestamp: &timestamp,
        })
    }
}

/// What a caller hands to [`AuditChain::append`]; the chain fills in the
/// sequence number, link, timestamp and hash.
///
/// A payload that fails to encode is held until [`append_in`], which refuses
/// the record.
#[derive(Debug)]
pub struct ChainRecord {
    pub actor: String,
    pub stage: String,
    pub input_hash: String,
    pub output_hash: String,
    pub verdict: Option<String>,
    encode_error: Option<serde_json::Error>,
}

impl ChainRecord {
    pub fn new(actor: impl Into<String>, stage: impl Into<String>) -> Self {
        let empty = digest::digest_str("");
        Self {
            actor: actor.into(),
            stage: stage.into(),
            input_hash: empty.clone(),
            output_hash: empty,
            verdict: None,
            encode_error: None,
        }
    }

    pub fn input<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match digest::digest_json(value) {
            Ok(hash) => self.input_hash = hash,
            Err(e) => self.encode_error = Some(e),
        }
        self
    }

    pub fn output<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match digest::digest_json(value) {
            Ok(hash) => self.output_hash = hash,
            Err(e) => self.encode_error = Some(e),
        }
        self
    }

    /// Use an already computed digest (e.g. of verification output).
    pub fn input_digest(mut self, digest: impl Into<String>) -> Self {
        self.input_hash = digest.into();
        self
    }

    pub fn verdict(mut self, verdict: impl Into<String>) -> Self {
        self.verdict = Some(verdict.into());
        self
    }
}

/// Append `record` inside an open transaction.
pub fn append_in(conn: &Connection, record: ChainRecord) -> Result<ChainEntry, StoreError> {
    if let Some(e) = record.encode_error {
        return Err(StoreError::Json(e));
    }
    let (sequence_no, prev_hash) = match store::chain::tail(conn)? {
        Some((seq, hash)) => (seq + 1, hash),
        None => (1, GENESIS_HASH.to_string()),
    };

    let mut entry = ChainEntry {
        sequence_no,
        actor: record.actor,
        stage: record.stage,
        input_hash: record.input_hash,
        output_hash: record.output_hash,
        prev_hash,
        verdict: record.verdict,
        // Stored at microsecond precision; truncate first so the hash matches
        // what a later read reconstructs.
        timestamp: Utc::now().trunc_subsecs(6),
        entry_hash: String::new(),
    };
    entry.entry_hash = entry.compute_hash();
    store::chain::insert(conn, &entry)?;

    tracing::debug!(
        seq = entry.sequence_no,
        actor = %entry.actor,
        stage = %entry.stage,
        "chain entry appended"
    );
    Ok(entry)
}

/// Verify the chain visible through `conn`.
pub fn verify_in(conn: &Connection) -> Result<ChainReport, StoreError> {
    let entries = store::chain::list_stored(conn)?;
    let head = store::chain::head(conn)?;
    Ok(verify::verify_entries(&entries, head.as_ref()))
}

/// Handle used by components that append outside a larger transaction.
#[derive(Clone)]
pub struct AuditChain {
    store: StoreHandle,
}

impl AuditChain {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub fn append(&self, record: ChainRecord) -> Result<ChainEntry, StoreError> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let entry = append_in(&tx, record)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Same as [`append`](Self::append) but runs on the blocking pool.
    pub async fn append_async(&self, record: ChainRecord) -> Result<ChainEntry, StoreError> {
        self.store
            .call(move |store| {
                let tx = store.transaction()?;
                let entry = append_in(&tx, record)?;
                tx.commit()?;
                Ok(entry)
            })
            .await
    }

    /// Verify the whole chain.
    ///
    /// The rows are read in one statement under the store lock and checked
    /// after the lock is released, so appends proceed while hashing runs.
    pub fn verify(&self) -> Result<ChainReport, StoreError> {
        let (entries, head) = {
            let guard = self.store.lock_sync()?;
            (store::chain::list_stored(guard.conn())?, store::chain::head(guard.conn())?)
        };
        let report = verify::verify_entries(&entries, head.as_ref());
        if !report.valid {
            tracing::error!(broken = ?report.broken, "audit chain failed verification");
        }
        Ok(report)
    }

    /// The newest `limit` entries, oldest first; all entries when `None`.
    pub fn entries(&self, limit: Option<usize>) -> Result<Vec<ChainEntry>, StoreError> {
        let guard = self.store.lock_sync()?;
        match limit {
            Some(limit) => store::chain::recent(guard.conn(), limit),
            None => store::chain::list(guard.conn()),
        }
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        let guard = self.store.lock_sync()?;
        store::chain::count(guard.conn())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    /// Run raw SQL against the chain with the append-only triggers removed,
    /// the way a privileged actor could.
    pub(crate) fn tamper(handle: &StoreHandle, sql: &str) {
        let guard = handle.lock_sync().unwrap();
        guard
            .conn()
            .execute_batch(
                "DROP TRIGGER IF EXISTS chain_entries_no_update;
                 DROP TRIGGER IF EXISTS chain_entries_no_delete;",
            )
            .unwrap();
        guard.conn().execute_batch(sql).unwrap();
    }

    fn chain_with(n: usize) -> (StoreHandle, AuditChain) {
        let handle = StoreHandle::in_memory().unwrap();
        let chain = AuditChain::new(handle.clone());
        for i in 0..n {
            chain
                .append(ChainRecord::new("tester", stage::TASK_TRANSITION).input(&i))
                .unwrap();
        }
        (handle, chain)
    }

    #[test]
    fn first_entry_links_to_genesis() {
        let (_, chain) = chain_with(1);
        let entries = chain.entries(None).unwrap();
        assert_eq!(entries[0].sequence_no, 1);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
    }

    #[test]
    fn entries_link_to_their_predecessor() {
        let (_, chain) = chain_with(3);
        let entries = chain.entries(None).unwrap();
        assert_eq!(entries[1].prev_hash, entries[0].entry_hash);
        assert_eq!(entries[2].prev_hash, entries[1].entry_hash);
    }

    #[test]
    fn untouched_chain_verifies() {
        let (_, chain) = chain_with(10);
        let report = chain.verify().unwrap();
        assert!(report.valid);
        assert!(report.broken.is_empty());
        assert_eq!(report.entries_checked, 10);
    }

    #[test]
    fn empty_chain_verifies() {
        let (_, chain) = chain_with(0);
        assert!(chain.verify().unwrap().valid);
        assert!(chain.is_empty().unwrap());
    }

    #[test]
    fn mutated_field_flags_exactly_that_entry() {
        let (handle, chain) = chain_with(5);
        tamper(&handle, "UPDATE chain_entries SET output_hash = 'forged' WHERE seq = 3");
        let report = chain.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken, vec![3]);
    }

    #[test]
    fn mutated_entry_hash_also_breaks_the_successor_link() {
        let (handle, chain) = chain_with(5);
        tamper(&handle, "UPDATE chain_entries SET entry_hash = 'forged' WHERE seq = 2");
        assert_eq!(chain.verify().unwrap().broken, vec![2, 3]);
    }

    #[test]
    fn deleted_entry_flags_the_entry_after_the_gap() {
        let (handle, chain) = chain_with(5);
        tamper(&handle, "DELETE FROM chain_entries WHERE seq = 3");
        let report = chain.verify().unwrap();
        assert_eq!(report.broken, vec![4]);
        assert!(report.issues.iter().any(|issue| matches!(
            issue.kind,
            ChainIssueKind::SequenceGap { expected: 3 }
        )));
    }

    #[test]
    fn truncated_tail_is_detected() {
        let (handle, chain) = chain_with(5);
        tamper(&handle, "DELETE FROM chain_entries WHERE seq >= 4");
        let report = chain.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken, vec![4]);
    }

    #[test]
    fn reordered_entries_are_detected() {
        let (handle, chain) = chain_with(5);
        tamper(
            &handle,
            "UPDATE chain_entries SET seq = -1 WHERE seq = 2;
             UPDATE chain_entries SET seq = 2 WHERE seq = 3;
             UPDATE chain_entries SET seq = 3 WHERE seq = -1;",
        );
        let report = chain.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken.first(), Some(&2));
    }

    #[test]
    fn equivalent_timestamp_rewrite_is_detected() {
        let (handle, chain) = chain_with(5);
        tamper(
            &handle,
            "UPDATE chain_entries SET timestamp = replace(timestamp, 'Z', '+00:00') WHERE seq = 3",
        );
        let report = chain.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken, vec![3]);
    }

    #[test]
    fn undecodable_timestamp_is_reported_not_raised() {
        let (handle, chain) = chain_with(5);
        tamper(&handle, "UPDATE chain_entries SET timestamp = '2026-13-99 forged' WHERE seq = 2");
        let report = chain.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken, vec![2]);
        assert!(report.issues.iter().any(|issue| issue.sequence_no == 2
            && issue.kind == ChainIssueKind::HashMismatch));
    }

    #[test]
    fn negative_sequence_is_reported_not_raised() {
        let (handle, chain) = chain_with(3);
        tamper(&handle, "UPDATE chain_entries SET seq = -7 WHERE seq = 1");
        let report = chain.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken.first(), Some(&1));
    }

    #[test]
    fn unencodable_payload_refuses_the_append() {
        use std::collections::BTreeMap;
        let (_, chain) = chain_with(1);
        let payload: BTreeMap<Vec<u8>, u8> = [(vec![7u8], 1u8)].into_iter().collect();
        let err = chain
            .append(ChainRecord::new("tester", stage::TASK_TRANSITION).output(&payload))
            .unwrap_err();
        assert!(matches!(err, StoreError::Json(_)));
        assert_eq!(chain.len().unwrap(), 1);
    }

    #[test]
    fn concurrent_appends_never_leave_gaps() {
        let (_, chain) = chain_with(0);
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let chain = chain.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        chain
                            .append(
                                ChainRecord::new(format!("reviewer-{worker}"), stage::REVIEW_INVOCATION)
                                    .input(&i),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let entries = chain.entries(None).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence_no).collect();
        assert_eq!(seqs, (1..=200).collect::<Vec<u64>>());
        assert!(chain.verify().unwrap().valid);
    }

    #[tokio::test]
    async fn async_appends_share_the_same_sequence() {
        let (_, chain) = chain_with(2);
        let futures = (0..4).map(|i| {
            let chain = chain.clone();
            async move {
                chain
                    .append_async(ChainRecord::new("reviewer", stage::REVIEW_INVOCATION).input(&i))
                    .await
            }
        });
        for result in futures::future::join_all(futures).await {
            result.unwrap();
        }
        assert_eq!(chain.len().unwrap(), 6);
        assert!(chain.verify().unwrap().valid);
    }

    #[test]
    fn entries_with_limit_returns_newest_oldest_first() {
        let (_, chain) = chain_with(6);
        let tail = chain.entries(Some(2)).unwrap();
        let seqs: Vec<u64> = tail.iter().map(|e| e.sequence_no).collect();
        assert_eq!(seqs, vec![5, 6]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn any_single_mutation_is_pinpointed(n in 1usize..24, pick in any::<prop::sample::Index>()) {
            let (handle, chain) = chain_with(n);
            prop_assert!(chain.verify().unwrap().valid);

            let target = pick.index(n) as u64 + 1;
            tamper(&handle, &format!("UPDATE chain_entries SET actor = 'mallory' WHERE seq = {target}"));
            let report = chain.verify().unwrap();
            prop_assert!(!report.valid);
            prop_assert_eq!(report.broken, vec![target]);
        }
    }
}
