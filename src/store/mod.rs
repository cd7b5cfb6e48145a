//! SQLite persistence for every Foreman component.
//!
//! One database per environment. `Store` owns the connection and the schema;
//! the per-table submodules hold plain functions over `&Connection` so callers
//! can compose several writes (plus the matching chain entry) inside a single
//! transaction.

pub mod chain;
pub mod decisions;
pub mod reviews;
pub mod session;
pub mod tasks;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open store at {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Malformed JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store task failed: {0}")]
    Join(String),
}

impl StoreError {
    pub(crate) fn corrupt(table: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            table,
            message: message.to_string(),
        }
    }
}

/// Cloneable, thread-safe handle to the store.
///
/// Every write in the system goes through the one mutex, which is what makes
/// chain sequencing single-writer. Async callers use [`StoreHandle::call`] so
/// SQLite I/O runs on the blocking pool.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Open an in-memory store and wrap it. Used by tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Store::open_in_memory()?))
    }

    /// Run a closure against the store on a blocking thread.
    pub async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Store) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| E::from(StoreError::Join(e.to_string())))?
    }

    /// Acquire the store synchronously. Fine from CLI commands and tests;
    /// avoid holding it across an `.await`.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, path: None };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin an immediate (write-locking) transaction.
    pub fn transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                producer TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                revision INTEGER NOT NULL DEFAULT 1,
                amends TEXT REFERENCES decisions(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS decision_revisions (
                decision_id TEXT NOT NULL REFERENCES decisions(id),
                revision INTEGER NOT NULL,
                text TEXT NOT NULL,
                concern_areas TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (decision_id, revision)
            );

            CREATE TABLE IF NOT EXISTS conflict_resolutions (
                conflict_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                decisions TEXT NOT NULL DEFAULT '[]',
                resolution TEXT NOT NULL,
                decision TEXT,
                rationale TEXT NOT NULL DEFAULT '',
                resolved_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS milestones (
                id TEXT PRIMARY KEY,
                ordinal INTEGER NOT NULL,
                name TEXT NOT NULL,
                goal TEXT NOT NULL DEFAULT '',
                integration_criteria TEXT NOT NULL DEFAULT '[]',
                state TEXT NOT NULL DEFAULT 'open',
                review_cycle_count INTEGER NOT NULL DEFAULT 0,
                cycle_allowance INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                milestone_id TEXT NOT NULL REFERENCES milestones(id),
                title TEXT NOT NULL,
                depends_on TEXT NOT NULL DEFAULT '[]',
                decision_refs TEXT NOT NULL DEFAULT '[]',
                file_scope TEXT NOT NULL DEFAULT '[]',
                acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                state TEXT NOT NULL DEFAULT 'pending',
                review_cycle_count INTEGER NOT NULL DEFAULT 0,
                cycle_allowance INTEGER NOT NULL DEFAULT 0,
                verification TEXT,
                override_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deferred_findings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                discovered_by_task INTEGER NOT NULL REFERENCES tasks(id),
                milestone_id TEXT NOT NULL REFERENCES milestones(id),
                category TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                promoted_task INTEGER,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );

            CREATE TABLE IF NOT EXISTS review_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject TEXT NOT NULL,
                cycle INTEGER NOT NULL,
                reviewer_id TEXT NOT NULL,
                verdict TEXT NOT NULL,
                findings TEXT NOT NULL DEFAULT '[]',
                chain_seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(subject, cycle, reviewer_id)
            );

            CREATE TABLE IF NOT EXISTS review_aggregates (
                subject TEXT NOT NULL,
                cycle INTEGER NOT NULL,
                kind TEXT NOT NULL,
                degraded INTEGER NOT NULL DEFAULT 0,
                gaps TEXT NOT NULL DEFAULT '[]',
                chain_seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (subject, cycle)
            );

            CREATE TABLE IF NOT EXISTS chain_entries (
                seq INTEGER PRIMARY KEY,
                actor TEXT NOT NULL,
                stage TEXT NOT NULL,
                input_hash TEXT NOT NULL,
                output_hash TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                verdict TEXT,
                timestamp TEXT NOT NULL,
                entry_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chain_head (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                seq INTEGER NOT NULL,
                entry_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lessons (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                summary TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                task_id INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                cycles_used INTEGER NOT NULL,
                reviewer_gaps INTEGER NOT NULL DEFAULT 0,
                findings_count INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                label TEXT PRIMARY KEY,
                chain_seq INTEGER NOT NULL,
                snapshot TEXT NOT NULL,
                digest TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_milestone ON tasks(milestone_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
            CREATE INDEX IF NOT EXISTS idx_findings_milestone ON deferred_findings(milestone_id);
            CREATE INDEX IF NOT EXISTS idx_reviews_subject ON review_records(subject, cycle);
            CREATE INDEX IF NOT EXISTS idx_evals_task ON evals(task_id);

            CREATE TRIGGER IF NOT EXISTS chain_entries_no_update
                BEFORE UPDATE ON chain_entries
                BEGIN SELECT RAISE(ABORT, 'chain_entries is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS chain_entries_no_delete
                BEFORE DELETE ON chain_entries
                BEGIN SELECT RAISE(ABORT, 'chain_entries is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS review_records_no_update
                BEFORE UPDATE ON review_records
                BEGIN SELECT RAISE(ABORT, 'review_records is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS review_aggregates_no_update
                BEFORE UPDATE ON review_aggregates
                BEGIN SELECT RAISE(ABORT, 'review_aggregates is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS decision_revisions_no_update
                BEFORE UPDATE ON decision_revisions
                BEGIN SELECT RAISE(ABORT, 'decision_revisions is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS lessons_no_update
                BEFORE UPDATE ON lessons
                BEGIN SELECT RAISE(ABORT, 'lessons is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS evals_no_update
                BEFORE UPDATE ON evals
                BEGIN SELECT RAISE(ABORT, 'evals is append-only'); END;
            ",
        )?;
        Ok(())
    }
}

// ── Column helpers ────────────────────────────────────────────────────

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(table: &'static str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::corrupt(table, e))
}

/// Canonical timestamp text: RFC 3339, UTC, microsecond precision.
pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(table, format!("bad timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_column<T>(table: &'static str, raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| StoreError::corrupt(table, format!("'{}': {}", raw, e)))
}

// ── Tests ─────────────────────────────────────────────────────────────
