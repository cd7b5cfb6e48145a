//! Immutable per-reviewer review records and closed-cycle aggregates.

use foreman_common::ReviewSubject;
use rusqlite::{Connection, params};

use super::{StoreError, from_json, parse_column, parse_timestamp, timestamp, to_json};
use crate::review::{Adjudication, ReviewRecord};

const SELECT_RECORD: &str = "
    SELECT subject, cycle, reviewer_id, verdict, findings, chain_seq, created_at
    FROM review_records";

/// Insert one record. The `(subject, cycle, reviewer_id)` unique key turns a
/// second verdict from the same reviewer into a constraint error; callers
/// check [`exists`] first to report it properly.
pub fn insert(conn: &Connection, record: &ReviewRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO review_records (subject, cycle, reviewer_id, verdict, findings, chain_seq, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.subject.to_string(),
            record.cycle,
            record.reviewer_id,
            record.verdict.as_str(),
            to_json(&record.findings)?,
            record.chain_seq as i64,
            timestamp(&record.created_at),
        ],
    )?;
    Ok(())
}

pub fn exists(conn: &Connection, subject: &ReviewSubject, cycle: u32, reviewer_id: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM review_records WHERE subject = ?1 AND cycle = ?2 AND reviewer_id = ?3",
        params![subject.to_string(), cycle, reviewer_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Records for one cycle, in the order they were written.
pub fn for_cycle(conn: &Connection, subject: &ReviewSubject, cycle: u32) -> Result<Vec<ReviewRecord>, StoreError> {
    collect(
        conn,
        &format!("{SELECT_RECORD} WHERE subject = ?1 AND cycle = ?2 ORDER BY id"),
        params![subject.to_string(), cycle],
    )
}

/// Every record for a subject across all cycles.
pub fn for_subject(conn: &Connection, subject: &ReviewSubject) -> Result<Vec<ReviewRecord>, StoreError> {
    collect(
        conn,
        &format!("{SELECT_RECORD} WHERE subject = ?1 ORDER BY cycle, id"),
        params![subject.to_string()],
    )
}

fn collect(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ReviewRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, read_record)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

// ── Adjudications ─────────────────────────────────────────────────────

pub fn insert_adjudication(conn: &Connection, adjudication: &Adjudication) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO review_aggregates (subject, cycle, kind, degraded, gaps, chain_seq, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            adjudication.subject.to_string(),
            adjudication.cycle,
            adjudication.kind.as_str(),
            adjudication.degraded,
            to_json(&adjudication.gaps)?,
            adjudication.chain_seq as i64,
            timestamp(&adjudication.created_at),
        ],
    )?;
    Ok(())
}

/// Highest closed cycle for a subject, 0 when none.
pub fn last_closed_cycle(conn: &Connection, subject: &ReviewSubject) -> Result<u32, StoreError> {
    let max: Option<u32> = conn.query_row(
        "SELECT MAX(cycle) FROM review_aggregates WHERE subject = ?1",
        params![subject.to_string()],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0))
}

pub fn adjudications(conn: &Connection, subject: &ReviewSubject) -> Result<Vec<Adjudication>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT subject, cycle, kind, degraded, gaps, chain_seq, created_at
         FROM review_aggregates WHERE subject = ?1 ORDER BY cycle",
    )?;
    let rows = stmt.query_map(params![subject.to_string()], |row| {
        Ok(AdjudicationRow {
            subject: row.get(0)?,
            cycle: row.get(1)?,
            kind: row.get(2)?,
            degraded: row.get(3)?,
            gaps: row.get(4)?,
            chain_seq: row.get(5)?,
            created_at: row.get(6)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_adjudication()?);
    }
    Ok(out)
}

struct AdjudicationRow {
    subject: String,
    cycle: u32,
    kind: String,
    degraded: bool,
    gaps: String,
    chain_seq: i64,
    created_at: String,
}

impl AdjudicationRow {
    fn into_adjudication(self) -> Result<Adjudication, StoreError> {
        const TABLE: &str = "review_aggregates";
        Ok(Adjudication {
            subject: parse_column(TABLE, &self.subject)?,
            cycle: self.cycle,
            kind: parse_column(TABLE, &self.kind)?,
            degraded: self.degraded,
            gaps: from_json(TABLE, &self.gaps)?,
            chain_seq: self.chain_seq as u64,
            created_at: parse_timestamp(TABLE, &self.created_at)?,
        })
    }
}

// ── Records ───────────────────────────────────────────────────────────

struct RecordRow {
    subject: String,
    cycle: u32,
    reviewer_id: String,
    verdict: String,
    findings: String,
    chain_seq: i64,
    created_at: String,
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        subject: row.get(0)?,
        cycle: row.get(1)?,
        reviewer_id: row.get(2)?,
        verdict: row.get(3)?,
        findings: row.get(4)?,
        chain_seq: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl RecordRow {
    fn into_record(self) -> Result<ReviewRecord, StoreError> {
        const TABLE: &str = "review_records";
        Ok(ReviewRecord {
            subject: parse_column(TABLE, &self.subject)?,
            cycle: self.cycle,
            reviewer_id: self.reviewer_id,
            verdict: parse_column(TABLE, &self.verdict)?,
            findings: from_json(TABLE, &self.findings)?,
            chain_seq: self.chain_seq as u64,
            created_at: parse_timestamp(TABLE, &self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::Utc;
    use foreman_common::{Finding, ReviewVerdict, TaskId};

    fn record(reviewer: &str, cycle: u32, verdict: ReviewVerdict) -> ReviewRecord {
        ReviewRecord {
            subject: ReviewSubject::Task(TaskId::new(1)),
            cycle,
            reviewer_id: reviewer.to_string(),
            verdict,
            findings: vec![Finding::new("missing null check").with_file("src/a.rs")],
            chain_seq: 7,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn records_are_read_back_per_cycle() {
        let store = Store::open_in_memory().unwrap();
        insert(store.conn(), &record("correctness", 1, ReviewVerdict::Block)).unwrap();
        insert(store.conn(), &record("security", 1, ReviewVerdict::Pass)).unwrap();
        insert(store.conn(), &record("correctness", 2, ReviewVerdict::Pass)).unwrap();

        let subject = ReviewSubject::Task(TaskId::new(1));
        let first = for_cycle(store.conn(), &subject, 1).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].verdict, ReviewVerdict::Block);
        assert_eq!(first[0].findings[0].file.as_deref(), Some("src/a.rs"));
        assert_eq!(first[0].chain_seq, 7);
        assert_eq!(for_subject(store.conn(), &subject).unwrap().len(), 3);
        assert!(exists(store.conn(), &subject, 2, "correctness").unwrap());
        assert!(!exists(store.conn(), &subject, 2, "security").unwrap());
    }

    #[test]
    fn a_second_verdict_from_one_reviewer_is_refused() {
        let store = Store::open_in_memory().unwrap();
        insert(store.conn(), &record("correctness", 1, ReviewVerdict::Pass)).unwrap();
        assert!(insert(store.conn(), &record("correctness", 1, ReviewVerdict::Block)).is_err());
    }

    #[test]
    fn closed_cycles_are_numbered_per_subject() {
        use crate::review::ReviewGap;
        use foreman_common::AggregateKind;

        let store = Store::open_in_memory().unwrap();
        let subject = ReviewSubject::Task(TaskId::new(1));
        assert_eq!(last_closed_cycle(store.conn(), &subject).unwrap(), 0);

        insert_adjudication(
            store.conn(),
            &Adjudication {
                subject: subject.clone(),
                cycle: 1,
                kind: AggregateKind::Concern,
                degraded: true,
                gaps: vec![ReviewGap::missing("security")],
                chain_seq: 3,
                created_at: Utc::now(),
            },
        )
        .unwrap();
        assert_eq!(last_closed_cycle(store.conn(), &subject).unwrap(), 1);
        assert_eq!(
            last_closed_cycle(store.conn(), &ReviewSubject::Task(TaskId::new(2))).unwrap(),
            0
        );
        let closed = adjudications(store.conn(), &subject).unwrap();
        assert_eq!(closed[0].kind, AggregateKind::Concern);
        assert_eq!(closed[0].gaps[0].reviewer, "security");
    }

    #[test]
    fn records_are_append_only() {
        let store = Store::open_in_memory().unwrap();
        insert(store.conn(), &record("correctness", 1, ReviewVerdict::Pass)).unwrap();
        let err = store
            .conn()
            .execute("UPDATE review_records SET verdict = 'block'", [])
            .unwrap_err();
        assert!(err.to_string().contains("append-only"));
    }
}
