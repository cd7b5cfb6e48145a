//! Lessons and eval rows. Both tables are insert-only.

use foreman_common::TaskId;
use rusqlite::{Connection, params};

use super::{StoreError, from_json, parse_column, parse_timestamp, timestamp, to_json};
use crate::telemetry::{EvalRecord, Lesson};

pub fn insert_lesson(conn: &Connection, lesson: &Lesson) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO lessons (summary, tags, task_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            lesson.summary,
            to_json(&lesson.tags)?,
            lesson.task_id.map(|t| t.ordinal()),
            timestamp(&lesson.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Every lesson, newest first.
pub fn list_lessons(conn: &Connection) -> Result<Vec<Lesson>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, summary, tags, task_id, created_at FROM lessons ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(LessonRow {
            id: row.get(0)?,
            summary: row.get(1)?,
            tags: row.get(2)?,
            task_id: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    let mut lessons = Vec::new();
    for row in rows {
        lessons.push(row?.into_lesson()?);
    }
    Ok(lessons)
}

pub fn insert_eval(conn: &Connection, eval: &EvalRecord) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO evals (task_id, outcome, cycles_used, reviewer_gaps, findings_count, duration_ms, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            eval.task_id.ordinal(),
            eval.outcome.as_str(),
            eval.cycles_used,
            eval.reviewer_gaps,
            eval.findings_count,
            eval.duration_ms as i64,
            timestamp(&eval.recorded_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Eval rows in insertion order, optionally for one task.
pub fn list_evals(conn: &Connection, task: Option<TaskId>) -> Result<Vec<EvalRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, outcome, cycles_used, reviewer_gaps, findings_count, duration_ms, recorded_at
         FROM evals WHERE ?1 IS NULL OR task_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![task.map(|t| t.ordinal())], |row| {
        Ok(EvalRow {
            id: row.get(0)?,
            task_id: row.get(1)?,
            outcome: row.get(2)?,
            cycles_used: row.get(3)?,
            reviewer_gaps: row.get(4)?,
            findings_count: row.get(5)?,
            duration_ms: row.get(6)?,
            recorded_at: row.get(7)?,
        })
    })?;
    let mut evals = Vec::new();
    for row in rows {
        evals.push(row?.into_eval()?);
    }
    Ok(evals)
}

struct LessonRow {
    id: i64,
    summary: String,
    tags: String,
    task_id: Option<u32>,
    created_at: String,
}

impl LessonRow {
    fn into_lesson(self) -> Result<Lesson, StoreError> {
        const TABLE: &str = "lessons";
        Ok(Lesson {
            id: self.id,
            summary: self.summary,
            tags: from_json(TABLE, &self.tags)?,
            task_id: self.task_id.map(TaskId::new),
            created_at: parse_timestamp(TABLE, &self.created_at)?,
        })
    }
}

struct EvalRow {
    id: i64,
    task_id: u32,
    outcome: String,
    cycles_used: u32,
    reviewer_gaps: u32,
    findings_count: u32,
    duration_ms: i64,
    recorded_at: String,
}

impl EvalRow {
    fn into_eval(self) -> Result<EvalRecord, StoreError> {
        const TABLE: &str = "evals";
        Ok(EvalRecord {
            id: Some(self.id),
            task_id: TaskId::new(self.task_id),
            outcome: parse_column(TABLE, &self.outcome)?,
            cycles_used: self.cycles_used,
            reviewer_gaps: self.reviewer_gaps,
            findings_count: self.findings_count,
            duration_ms: self.duration_ms.max(0) as u64,
            recorded_at: parse_timestamp(TABLE, &self.recorded_at)?,
        })
    }
}
