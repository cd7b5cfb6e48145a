use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use foreman_common::DecisionId;
use rusqlite::{Connection, OptionalExtension, params};

use super::{StoreError, from_json, parse_column, parse_timestamp, timestamp, to_json};
use crate::decision::{ConflictResolution, Decision, DecisionRevision, DecisionStatus};

const TABLE: &str = "decisions";

const SELECT_DECISION: &str = "
    SELECT d.id, d.producer, d.status, d.revision, d.amends, d.created_at, d.updated_at,
           r.text, r.concern_areas
    FROM decisions d
    JOIN decision_revisions r ON r.decision_id = d.id AND r.revision = d.revision";

// ── Decisions ─────────────────────────────────────────────────────────

/// Insert a new decision together with its first revision.
pub fn insert(conn: &Connection, decision: &Decision) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO decisions (id, producer, status, revision, amends, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            decision.id.as_str(),
            decision.producer,
            decision.status.as_str(),
            decision.revision,
            decision.amends.as_ref().map(|a| a.as_str()),
            timestamp(&decision.created_at),
            timestamp(&decision.updated_at),
        ],
    )?;
    insert_revision(
        conn,
        &DecisionRevision {
            decision_id: decision.id.clone(),
            revision: decision.revision,
            text: decision.text.clone(),
            concern_areas: decision.concern_areas.clone(),
            status: decision.status,
            created_at: decision.created_at,
        },
    )
}

pub fn insert_revision(conn: &Connection, revision: &DecisionRevision) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO decision_revisions (decision_id, revision, text, concern_areas, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            revision.decision_id.as_str(),
            revision.revision,
            revision.text,
            to_json(&revision.concern_areas)?,
            revision.status.as_str(),
            timestamp(&revision.created_at),
        ],
    )?;
    Ok(())
}

/// Point the decision at a (new) current revision and status.
pub fn update_head(
    conn: &Connection,
    id: &DecisionId,
    status: DecisionStatus,
    revision: u32,
    at: &DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE decisions SET status = ?1, revision = ?2, updated_at = ?3 WHERE id = ?4",
        params![status.as_str(), revision, timestamp(at), id.as_str()],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: &DecisionId) -> Result<Option<Decision>, StoreError> {
    let row = conn
        .query_row(
            &format!("{SELECT_DECISION} WHERE d.id = ?1"),
            params![id.as_str()],
            read_row,
        )
        .optional()?;
    row.map(DecisionRow::into_decision).transpose()
}

pub fn list(conn: &Connection) -> Result<Vec<Decision>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_DECISION} ORDER BY d.id"))?;
    let rows = stmt.query_map([], read_row)?;
    let mut decisions = Vec::new();
    for row in rows {
        decisions.push(row?.into_decision()?);
    }
    Ok(decisions)
}

pub fn history(conn: &Connection, id: &DecisionId) -> Result<Vec<DecisionRevision>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT decision_id, revision, text, concern_areas, status, created_at
         FROM decision_revisions WHERE decision_id = ?1 ORDER BY revision",
    )?;
    let rows = stmt.query_map(params![id.as_str()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u32>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;
    let mut revisions = Vec::new();
    for row in rows {
        let (decision_id, revision, text, concern_areas, status, created_at) = row?;
        revisions.push(DecisionRevision {
            decision_id: parse_column("decision_revisions", &decision_id)?,
            revision,
            text,
            concern_areas: from_json("decision_revisions", &concern_areas)?,
            status: parse_column("decision_revisions", &status)?,
            created_at: parse_timestamp("decision_revisions", &created_at)?,
        });
    }
    Ok(revisions)
}

/// The tag a producer has already used, if any.
pub fn producer_tag(conn: &Connection, producer: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT substr(id, 1, 4) FROM decisions WHERE producer = ?1 ORDER BY created_at LIMIT 1",
            params![producer],
            |row| row.get(0),
        )
        .optional()?)
}

/// The producer that owns a tag, if any.
pub fn tag_owner(conn: &Connection, tag: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT producer FROM decisions WHERE substr(id, 1, 4) = ?1 LIMIT 1",
            params![tag],
            |row| row.get(0),
        )
        .optional()?)
}

/// Highest ordinal used under `tag` (0 when unused).
pub fn last_ordinal(conn: &Connection, tag: &str) -> Result<u32, StoreError> {
    let mut stmt = conn.prepare("SELECT id FROM decisions WHERE substr(id, 1, 4) = ?1")?;
    let rows = stmt.query_map(params![tag], |row| row.get::<_, String>(0))?;
    let mut last = 0;
    for row in rows {
        let id: DecisionId = parse_column(TABLE, &row?)?;
        last = last.max(id.ordinal());
    }
    Ok(last)
}

// ── Conflict resolutions ──────────────────────────────────────────────

pub fn insert_resolution(conn: &Connection, resolution: &ConflictResolution) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO conflict_resolutions
            (conflict_id, kind, decisions, resolution, decision, rationale, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            resolution.conflict_id,
            resolution.kind.as_str(),
            to_json(&resolution.decisions)?,
            resolution.resolution.as_str(),
            resolution.decision.as_ref().map(|d| d.as_str()),
            resolution.rationale,
            timestamp(&resolution.resolved_at),
        ],
    )?;
    Ok(())
}

pub fn resolved_ids(conn: &Connection) -> Result<BTreeSet<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT conflict_id FROM conflict_resolutions")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut ids = BTreeSet::new();
    for row in rows {
        ids.insert(row?);
    }
    Ok(ids)
}

pub fn list_resolutions(conn: &Connection) -> Result<Vec<ConflictResolution>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT conflict_id, kind, decisions, resolution, decision, rationale, resolved_at
         FROM conflict_resolutions ORDER BY resolved_at, conflict_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;
    let table = "conflict_resolutions";
    let mut resolutions = Vec::new();
    for row in rows {
        let (conflict_id, kind, decisions, resolution, decision, rationale, resolved_at) = row?;
        resolutions.push(ConflictResolution {
            conflict_id,
            kind: parse_column(table, &kind)?,
            decisions: from_json(table, &decisions)?,
            resolution: parse_column(table, &resolution)?,
            decision: decision.map(|d| parse_column(table, &d)).transpose()?,
            rationale,
            resolved_at: parse_timestamp(table, &resolved_at)?,
        });
    }
    Ok(resolutions)
}

// ── Internal row helpers ──────────────────────────────────────────────

struct DecisionRow {
    id: String,
    producer: String,
    status: String,
    revision: u32,
    amends: Option<String>,
    created_at: String,
    updated_at: String,
    text: String,
    concern_areas: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRow> {
    Ok(DecisionRow {
        id: row.get(0)?,
        producer: row.get(1)?,
        status: row.get(2)?,
        revision: row.get(3)?,
        amends: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        text: row.get(7)?,
        concern_areas: row.get(8)?,
    })
}

impl DecisionRow {
    fn into_decision(self) -> Result<Decision, StoreError> {
        Ok(Decision {
            id: parse_column(TABLE, &self.id)?,
            producer: self.producer,
            text: self.text,
            status: parse_column(TABLE, &self.status)?,
            concern_areas: from_json(TABLE, &self.concern_areas)?,
            revision: self.revision,
            amends: self.amends.map(|a| parse_column(TABLE, &a)).transpose()?,
            created_at: parse_timestamp(TABLE, &self.created_at)?,
            updated_at: parse_timestamp(TABLE, &self.updated_at)?,
        })
    }
}
