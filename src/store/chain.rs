use rusqlite::{Connection, OptionalExtension, params};

use super::{StoreError, parse_timestamp, timestamp};
use crate::chain::{ChainEntry, StoredEntry};

const TABLE: &str = "chain_entries";

/// Sequence number and hash of the last stored entry.
pub fn tail(conn: &Connection) -> Result<Option<(u64, String)>, StoreError> {
    let row = conn
        .query_row(
            "SELECT seq, entry_hash FROM chain_entries ORDER BY seq DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(seq, hash)| (seq as u64, hash)))
}

/// The head pointer maintained alongside the entries.
pub fn head(conn: &Connection) -> Result<Option<(u64, String)>, StoreError> {
    let row = conn
        .query_row("SELECT seq, entry_hash FROM chain_head WHERE id = 1", [], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .optional()?;
    Ok(row.map(|(seq, hash)| (seq as u64, hash)))
}

pub fn insert(conn: &Connection, entry: &ChainEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO chain_entries
            (seq, actor, stage, input_hash, output_hash, prev_hash, verdict, timestamp, entry_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.sequence_no as i64,
            entry.actor,
            entry.stage,
            entry.input_hash,
            entry.output_hash,
            entry.prev_hash,
            entry.verdict,
            timestamp(&entry.timestamp),
            entry.entry_hash,
        ],
    )?;
    conn.execute(
        "INSERT INTO chain_head (id, seq, entry_hash) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET seq = excluded.seq, entry_hash = excluded.entry_hash",
        params![entry.sequence_no as i64, entry.entry_hash],
    )?;
    Ok(())
}

/// Every entry in sequence order.
pub fn list(conn: &Connection) -> Result<Vec<ChainEntry>, StoreError> {
    collect(list_stored(conn)?)
}

/// Every row in sequence order, undecoded. Verification reads these.
pub fn list_stored(conn: &Connection) -> Result<Vec<StoredEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT seq, actor, stage, input_hash, output_hash, prev_hash, verdict, timestamp, entry_hash
         FROM chain_entries ORDER BY seq",
    )?;
    let rows = stmt.query_map([], read_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// The last `limit` entries, oldest first.
pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<ChainEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT seq, actor, stage, input_hash, output_hash, prev_hash, verdict, timestamp, entry_hash
         FROM (SELECT * FROM chain_entries ORDER BY seq DESC LIMIT ?1) ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![limit as i64], read_row)?;
    collect(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count(conn: &Connection) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM chain_entries", [], |row| row.get(0))?;
    Ok(n as u64)
}

// ── Internal row helpers ──────────────────────────────────────────────

fn into_entry(row: StoredEntry) -> Result<ChainEntry, StoreError> {
    let sequence_no = u64::try_from(row.seq)
        .map_err(|_| StoreError::corrupt(TABLE, format!("negative seq {}", row.seq)))?;
    Ok(ChainEntry {
        sequence_no,
        timestamp: parse_timestamp(TABLE, &row.timestamp)?,
        actor: row.actor,
        stage: row.stage,
        input_hash: row.input_hash,
        output_hash: row.output_hash,
        prev_hash: row.prev_hash,
        verdict: row.verdict,
        entry_hash: row.entry_hash,
    })
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEntry> {
    Ok(StoredEntry {
        seq: row.get(0)?,
        actor: row.get(1)?,
        stage: row.get(2)?,
        input_hash: row.get(3)?,
        output_hash: row.get(4)?,
        prev_hash: row.get(5)?,
        verdict: row.get(6)?,
        timestamp: row.get(7)?,
        entry_hash: row.get(8)?,
    })
}

fn collect(rows: Vec<StoredEntry>) -> Result<Vec<ChainEntry>, StoreError> {
    rows.into_iter().map(into_entry).collect()
}
