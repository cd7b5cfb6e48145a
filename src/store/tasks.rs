//! Milestones, tasks, deferred findings and graph checkpoints.

use chrono::{DateTime, Utc};
use foreman_common::{FindingId, MilestoneId, TaskId};
use rusqlite::{Connection, OptionalExtension, params};

use super::{StoreError, from_json, parse_column, parse_timestamp, timestamp, to_json};
use crate::graph::{Checkpoint, DeferredFinding, Milestone, Task};

// ── Milestones ────────────────────────────────────────────────────────

const SELECT_MILESTONE: &str = "
    SELECT id, ordinal, name, goal, integration_criteria, state, review_cycle_count,
           cycle_allowance, created_at, completed_at
    FROM milestones";

pub fn insert_milestone(conn: &Connection, milestone: &Milestone) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO milestones (id, ordinal, name, goal, integration_criteria, state,
                                 review_cycle_count, cycle_allowance, created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            milestone.id.as_str(),
            milestone.ordinal,
            milestone.name,
            milestone.goal,
            to_json(&milestone.integration_criteria)?,
            milestone.state.as_str(),
            milestone.review_cycle_count,
            milestone.cycle_allowance,
            timestamp(&milestone.created_at),
            milestone.completed_at.as_ref().map(timestamp),
        ],
    )?;
    Ok(())
}

/// Persist the mutable milestone columns.
pub fn update_milestone(conn: &Connection, milestone: &Milestone) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE milestones SET state = ?1, review_cycle_count = ?2, cycle_allowance = ?3,
                               completed_at = ?4
         WHERE id = ?5",
        params![
            milestone.state.as_str(),
            milestone.review_cycle_count,
            milestone.cycle_allowance,
            milestone.completed_at.as_ref().map(timestamp),
            milestone.id.as_str(),
        ],
    )?;
    Ok(())
}

pub fn get_milestone(conn: &Connection, id: &MilestoneId) -> Result<Option<Milestone>, StoreError> {
    conn.query_row(
        &format!("{SELECT_MILESTONE} WHERE id = ?1"),
        params![id.as_str()],
        read_milestone,
    )
    .optional()?
    .map(MilestoneRow::into_milestone)
    .transpose()
}

pub fn list_milestones(conn: &Connection) -> Result<Vec<Milestone>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_MILESTONE} ORDER BY ordinal"))?;
    let rows = stmt.query_map([], read_milestone)?;
    let mut milestones = Vec::new();
    for row in rows {
        milestones.push(row?.into_milestone()?);
    }
    Ok(milestones)
}

pub fn next_milestone_ordinal(conn: &Connection) -> Result<u32, StoreError> {
    let max: Option<u32> = conn.query_row("SELECT MAX(ordinal) FROM milestones", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0) + 1)
}

struct MilestoneRow {
    id: String,
    ordinal: u32,
    name: String,
    goal: String,
    integration_criteria: String,
    state: String,
    review_cycle_count: u32,
    cycle_allowance: u32,
    created_at: String,
    completed_at: Option<String>,
}

fn read_milestone(row: &rusqlite::Row<'_>) -> rusqlite::Result<MilestoneRow> {
    Ok(MilestoneRow {
        id: row.get(0)?,
        ordinal: row.get(1)?,
        name: row.get(2)?,
        goal: row.get(3)?,
        integration_criteria: row.get(4)?,
        state: row.get(5)?,
        review_cycle_count: row.get(6)?,
        cycle_allowance: row.get(7)?,
        created_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

impl MilestoneRow {
    fn into_milestone(self) -> Result<Milestone, StoreError> {
        const TABLE: &str = "milestones";
        Ok(Milestone {
            id: parse_column(TABLE, &self.id)?,
            ordinal: self.ordinal,
            name: self.name,
            goal: self.goal,
            integration_criteria: from_json(TABLE, &self.integration_criteria)?,
            state: parse_column(TABLE, &self.state)?,
            review_cycle_count: self.review_cycle_count,
            cycle_allowance: self.cycle_allowance,
            created_at: parse_timestamp(TABLE, &self.created_at)?,
            completed_at: self
                .completed_at
                .map(|at| parse_timestamp(TABLE, &at))
                .transpose()?,
        })
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────

const SELECT_TASK: &str = "
    SELECT id, milestone_id, title, depends_on, decision_refs, file_scope, acceptance_criteria,
           state, review_cycle_count, cycle_allowance, verification, override_reason,
           created_at, updated_at
    FROM tasks";

pub fn insert_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tasks (id, milestone_id, title, depends_on, decision_refs, file_scope,
                            acceptance_criteria, state, review_cycle_count, cycle_allowance,
                            verification, override_reason, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            task.id.ordinal(),
            task.milestone_id.as_str(),
            task.title,
            to_json(&task.depends_on)?,
            to_json(&task.decision_refs)?,
            to_json(&task.file_scope)?,
            to_json(&task.acceptance_criteria)?,
            task.state.as_str(),
            task.review_cycle_count,
            task.cycle_allowance,
            task.verification.as_ref().map(to_json).transpose()?,
            task.override_reason,
            timestamp(&task.created_at),
            timestamp(&task.updated_at),
        ],
    )?;
    Ok(())
}

/// Persist the mutable task columns. The definition itself never changes.
pub fn update_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tasks SET state = ?1, review_cycle_count = ?2, cycle_allowance = ?3,
                          verification = ?4, override_reason = ?5, updated_at = ?6
         WHERE id = ?7",
        params![
            task.state.as_str(),
            task.review_cycle_count,
            task.cycle_allowance,
            task.verification.as_ref().map(to_json).transpose()?,
            task.override_reason,
            timestamp(&task.updated_at),
            task.id.ordinal(),
        ],
    )?;
    Ok(())
}

pub fn get_task(conn: &Connection, id: TaskId) -> Result<Option<Task>, StoreError> {
    conn.query_row(
        &format!("{SELECT_TASK} WHERE id = ?1"),
        params![id.ordinal()],
        read_task,
    )
    .optional()?
    .map(TaskRow::into_task)
    .transpose()
}

/// Every task in queue order.
pub fn list_tasks(conn: &Connection) -> Result<Vec<Task>, StoreError> {
    collect_tasks(conn, &format!("{SELECT_TASK} ORDER BY id"), &[])
}

pub fn tasks_in_milestone(conn: &Connection, milestone: &MilestoneId) -> Result<Vec<Task>, StoreError> {
    collect_tasks(
        conn,
        &format!("{SELECT_TASK} WHERE milestone_id = ?1 ORDER BY id"),
        &[&milestone.as_str()],
    )
}

/// The task holding the execution slot, if any.
pub fn active_tasks(conn: &Connection) -> Result<Vec<TaskId>, StoreError> {
    let mut stmt = conn.prepare("SELECT id FROM tasks WHERE state IN ('in_progress', 'under_review') ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get::<_, u32>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(TaskId::new(row?));
    }
    Ok(ids)
}

pub fn max_task_ordinal(conn: &Connection) -> Result<u32, StoreError> {
    let max: Option<u32> = conn.query_row("SELECT MAX(id) FROM tasks", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0))
}

fn collect_tasks(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Task>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, read_task)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?.into_task()?);
    }
    Ok(tasks)
}

struct TaskRow {
    id: u32,
    milestone_id: String,
    title: String,
    depends_on: String,
    decision_refs: String,
    file_scope: String,
    acceptance_criteria: String,
    state: String,
    review_cycle_count: u32,
    cycle_allowance: u32,
    verification: Option<String>,
    override_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        milestone_id: row.get(1)?,
        title: row.get(2)?,
        depends_on: row.get(3)?,
        decision_refs: row.get(4)?,
        file_scope: row.get(5)?,
        acceptance_criteria: row.get(6)?,
        state: row.get(7)?,
        review_cycle_count: row.get(8)?,
        cycle_allowance: row.get(9)?,
        verification: row.get(10)?,
        override_reason: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task, StoreError> {
        const TABLE: &str = "tasks";
        Ok(Task {
            id: TaskId::new(self.id),
            milestone_id: parse_column(TABLE, &self.milestone_id)?,
            title: self.title,
            depends_on: from_json(TABLE, &self.depends_on)?,
            decision_refs: from_json(TABLE, &self.decision_refs)?,
            file_scope: from_json(TABLE, &self.file_scope)?,
            acceptance_criteria: from_json(TABLE, &self.acceptance_criteria)?,
            state: parse_column(TABLE, &self.state)?,
            review_cycle_count: self.review_cycle_count,
            cycle_allowance: self.cycle_allowance,
            verification: self
                .verification
                .map(|raw| from_json(TABLE, &raw))
                .transpose()?,
            override_reason: self.override_reason,
            created_at: parse_timestamp(TABLE, &self.created_at)?,
            updated_at: parse_timestamp(TABLE, &self.updated_at)?,
        })
    }
}

// ── Deferred findings ─────────────────────────────────────────────────

const SELECT_FINDING: &str = "
    SELECT id, discovered_by_task, milestone_id, category, description, status, promoted_task,
           created_at, resolved_at
    FROM deferred_findings";

/// Insert a finding and return its allocated id.
pub fn insert_finding(
    conn: &Connection,
    task: TaskId,
    milestone: &MilestoneId,
    category: &str,
    description: &str,
    at: &DateTime<Utc>,
) -> Result<FindingId, StoreError> {
    conn.execute(
        "INSERT INTO deferred_findings (discovered_by_task, milestone_id, category, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![task.ordinal(), milestone.as_str(), category, description, timestamp(at)],
    )?;
    let id = u32::try_from(conn.last_insert_rowid())
        .map_err(|e| StoreError::corrupt("deferred_findings", e))?;
    Ok(FindingId::new(id))
}

pub fn update_finding(conn: &Connection, finding: &DeferredFinding) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE deferred_findings SET status = ?1, promoted_task = ?2, resolved_at = ?3 WHERE id = ?4",
        params![
            finding.status.as_str(),
            finding.promoted_task.map(|t| t.ordinal()),
            finding.resolved_at.as_ref().map(timestamp),
            finding.id.number(),
        ],
    )?;
    Ok(())
}

pub fn get_finding(conn: &Connection, id: FindingId) -> Result<Option<DeferredFinding>, StoreError> {
    conn.query_row(
        &format!("{SELECT_FINDING} WHERE id = ?1"),
        params![id.number()],
        read_finding,
    )
    .optional()?
    .map(FindingRow::into_finding)
    .transpose()
}

pub fn list_findings(conn: &Connection) -> Result<Vec<DeferredFinding>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_FINDING} ORDER BY id"))?;
    let rows = stmt.query_map([], read_finding)?;
    let mut findings = Vec::new();
    for row in rows {
        findings.push(row?.into_finding()?);
    }
    Ok(findings)
}

struct FindingRow {
    id: u32,
    discovered_by_task: u32,
    milestone_id: String,
    category: String,
    description: String,
    status: String,
    promoted_task: Option<u32>,
    created_at: String,
    resolved_at: Option<String>,
}

fn read_finding(row: &rusqlite::Row<'_>) -> rusqlite::Result<FindingRow> {
    Ok(FindingRow {
        id: row.get(0)?,
        discovered_by_task: row.get(1)?,
        milestone_id: row.get(2)?,
        category: row.get(3)?,
        description: row.get(4)?,
        status: row.get(5)?,
        promoted_task: row.get(6)?,
        created_at: row.get(7)?,
        resolved_at: row.get(8)?,
    })
}

impl FindingRow {
    fn into_finding(self) -> Result<DeferredFinding, StoreError> {
        const TABLE: &str = "deferred_findings";
        Ok(DeferredFinding {
            id: FindingId::new(self.id),
            discovered_by_task: TaskId::new(self.discovered_by_task),
            milestone_id: parse_column(TABLE, &self.milestone_id)?,
            category: self.category,
            description: self.description,
            status: parse_column(TABLE, &self.status)?,
            promoted_task: self.promoted_task.map(TaskId::new),
            created_at: parse_timestamp(TABLE, &self.created_at)?,
            resolved_at: self
                .resolved_at
                .map(|at| parse_timestamp(TABLE, &at))
                .transpose()?,
        })
    }
}

// ── Checkpoints ───────────────────────────────────────────────────────

pub fn insert_checkpoint(conn: &Connection, checkpoint: &Checkpoint) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO checkpoints (label, chain_seq, snapshot, digest, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            checkpoint.label,
            checkpoint.chain_seq as i64,
            to_json(&checkpoint.snapshot)?,
            checkpoint.digest,
            timestamp(&checkpoint.created_at),
        ],
    )?;
    Ok(())
}

pub fn checkpoint_exists(conn: &Connection, label: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM checkpoints WHERE label = ?1", params![label], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn get_checkpoint(conn: &Connection, label: &str) -> Result<Option<Checkpoint>, StoreError> {
    conn.query_row(
        "SELECT label, chain_seq, snapshot, digest, created_at FROM checkpoints WHERE label = ?1",
        params![label],
        read_checkpoint,
    )
    .optional()?
    .map(CheckpointRow::into_checkpoint)
    .transpose()
}

pub fn list_checkpoints(conn: &Connection) -> Result<Vec<Checkpoint>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT label, chain_seq, snapshot, digest, created_at FROM checkpoints ORDER BY chain_seq, label",
    )?;
    let rows = stmt.query_map([], read_checkpoint)?;
    let mut checkpoints = Vec::new();
    for row in rows {
        checkpoints.push(row?.into_checkpoint()?);
    }
    Ok(checkpoints)
}

struct CheckpointRow {
    label: String,
    chain_seq: i64,
    snapshot: String,
    digest: String,
    created_at: String,
}

fn read_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok(CheckpointRow {
        label: row.get(0)?,
        chain_seq: row.get(1)?,
        snapshot: row.get(2)?,
        digest: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint, StoreError> {
        const TABLE: &str = "checkpoints";
        Ok(Checkpoint {
            label: self.label,
            chain_seq: self.chain_seq as u64,
            snapshot: from_json(TABLE, &self.snapshot)?,
            digest: self.digest,
            created_at: parse_timestamp(TABLE, &self.created_at)?,
        })
    }
}
