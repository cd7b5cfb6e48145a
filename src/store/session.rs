use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::{StoreError, timestamp};

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row("SELECT value FROM session WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?)
}

pub fn set(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO session (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, timestamp(&Utc::now())],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, key: &str) -> Result<bool, StoreError> {
    let affected = conn.execute("DELETE FROM session WHERE key = ?1", params![key])?;
    Ok(affected > 0)
}
