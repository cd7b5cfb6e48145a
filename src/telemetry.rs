//! Reflexion lessons and per-task eval metrics.
//!
//! Both stores are additive: there is no update or delete. Lesson lookup is
//! a tag-intersection hint used before a task starts, so an empty result is
//! a normal answer rather than an error.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use foreman_common::TaskId;
use serde::{Deserialize, Serialize};

use crate::chain::{self, ChainRecord, stage};
use crate::errors::{ContractError, Result};
use crate::store::{self, StoreHandle};

const ACTOR: &str = "telemetry";

/// A short note learned from a past task, tagged by concern area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: i64,
    pub summary: String,
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
}

impl Lesson {
    /// Number of `tags` this lesson carries.
    pub fn overlap(&self, tags: &BTreeSet<String>) -> usize {
        self.tags.intersection(tags).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalOutcome {
    Done,
    Blocked,
    Cancelled,
}

impl EvalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EvalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvalOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            "cancelled" => Ok(Self::Cancelled),
            _ => anyhow::bail!("Invalid eval outcome '{}'", s),
        }
    }
}

/// Metrics recorded when a task reaches a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub task_id: TaskId,
    pub outcome: EvalOutcome,
    pub cycles_used: u32,
    pub reviewer_gaps: u32,
    pub findings_count: u32,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl EvalRecord {
    pub fn new(task_id: TaskId, outcome: EvalOutcome) -> Self {
        Self {
            id: None,
            task_id,
            outcome,
            cycles_used: 0,
            reviewer_gaps: 0,
            findings_count: 0,
            duration_ms: 0,
            recorded_at: Utc::now(),
        }
    }
}

/// Roll-up over a set of eval rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvalSummary {
    pub tasks: usize,
    pub done: usize,
    pub blocked: usize,
    pub average_cycles: f64,
    pub total_gaps: u32,
}

impl EvalSummary {
    pub fn from_records(records: &[EvalRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let cycles: u32 = records.iter().map(|r| r.cycles_used).sum();
        Self {
            tasks: records.len(),
            done: records.iter().filter(|r| r.outcome == EvalOutcome::Done).count(),
            blocked: records.iter().filter(|r| r.outcome == EvalOutcome::Blocked).count(),
            average_cycles: f64::from(cycles) / records.len() as f64,
            total_gaps: records.iter().map(|r| r.reviewer_gaps).sum(),
        }
    }
}

/// Lower-case, trimmed, de-duplicated tags.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

#[derive(Clone)]
pub struct Telemetry {
    store: StoreHandle,
}

impl Telemetry {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub fn record_lesson<I, S>(&self, summary: &str, tags: I, task: Option<TaskId>) -> Result<Lesson>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(ContractError::Invalid("A lesson needs a summary".to_string()).into());
        }
        let tags = normalize_tags(tags);
        if tags.is_empty() {
            return Err(ContractError::Invalid("A lesson needs at least one tag".to_string()).into());
        }

        let mut lesson = Lesson {
            id: 0,
            summary: summary.to_string(),
            tags,
            task_id: task,
            created_at: Utc::now(),
        };
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        lesson.id = store::telemetry::insert_lesson(&tx, &lesson)?;
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::LESSON_RECORD)
                .input(&lesson.tags)
                .output(&lesson)
                .verdict("recorded"),
        )?;
        tx.commit()?;
        tracing::debug!(lesson = lesson.id, tags = ?lesson.tags, "lesson recorded");
        Ok(lesson)
    }

    /// Lessons sharing at least one tag with `tags`, most overlapping first,
    /// newest first within equal overlap.
    pub fn query_lessons<I, S>(&self, tags: I) -> Result<Vec<Lesson>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let wanted = normalize_tags(tags);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let guard = self.store.lock_sync()?;
        let mut matches: Vec<(usize, Lesson)> = store::telemetry::list_lessons(guard.conn())?
            .into_iter()
            .map(|lesson| (lesson.overlap(&wanted), lesson))
            .filter(|(overlap, _)| *overlap > 0)
            .collect();
        // list_lessons is newest-first and sort_by is stable
        matches.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(matches.into_iter().map(|(_, lesson)| lesson).collect())
    }

    pub fn record_eval(&self, mut eval: EvalRecord) -> Result<EvalRecord> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        eval.id = Some(store::telemetry::insert_eval(&tx, &eval)?);
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::EVAL_RECORD)
                .input(&eval.task_id)
                .output(&eval)
                .verdict(eval.outcome.as_str()),
        )?;
        tx.commit()?;
        tracing::info!(
            task = %eval.task_id,
            outcome = %eval.outcome,
            cycles = eval.cycles_used,
            gaps = eval.reviewer_gaps,
            "eval recorded"
        );
        Ok(eval)
    }

    pub fn evals(&self, task: Option<TaskId>) -> Result<Vec<EvalRecord>> {
        let guard = self.store.lock_sync()?;
        Ok(store::telemetry::list_evals(guard.conn(), task)?)
    }
}
