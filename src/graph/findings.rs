//! Deferred findings: scope gaps noticed mid-task that belong elsewhere.
//!
//! A finding is logged against the milestone of the task that found it and
//! can only be resolved once that milestone is complete.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use foreman_common::{FindingId, MilestoneId, TaskId};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::{ACTOR, MilestoneState, TaskGraph, TaskSpec, add_task_in, get_milestone_in, get_task_in};
use crate::chain::{self, ChainRecord, stage};
use crate::errors::{ContractError, InvariantViolation, Result};
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Open,
    Promoted,
    Deferred,
    Dismissed,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Promoted => "promoted",
            Self::Deferred => "deferred",
            Self::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FindingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "promoted" => Ok(Self::Promoted),
            "deferred" => Ok(Self::Deferred),
            "dismissed" => Ok(Self::Dismissed),
            _ => anyhow::bail!("Invalid finding status '{}'", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredFinding {
    pub id: FindingId,
    pub discovered_by_task: TaskId,
    pub milestone_id: MilestoneId,
    pub category: String,
    pub description: String,
    pub status: FindingStatus,
    pub promoted_task: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

fn get_finding_in(conn: &Connection, id: FindingId) -> Result<DeferredFinding> {
    store::tasks::get_finding(conn, id)?.ok_or_else(|| ContractError::UnknownFinding(id).into())
}

/// Load an open finding whose milestone is complete.
fn resolvable_in(conn: &Connection, id: FindingId) -> Result<DeferredFinding> {
    let finding = get_finding_in(conn, id)?;
    if finding.status != FindingStatus::Open {
        return Err(InvariantViolation::FindingAlreadyResolved(id).into());
    }
    let milestone = get_milestone_in(conn, &finding.milestone_id)?;
    if milestone.state != MilestoneState::Complete {
        return Err(InvariantViolation::FindingNotResolvable {
            finding: id,
            milestone: milestone.id,
        }
        .into());
    }
    Ok(finding)
}

fn close_in(conn: &Connection, mut finding: DeferredFinding, status: FindingStatus) -> Result<DeferredFinding> {
    finding.status = status;
    finding.resolved_at = Some(Utc::now());
    store::tasks::update_finding(conn, &finding)?;
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::FINDING_RESOLVE)
            .input(&finding.id)
            .output(&finding)
            .verdict(status.as_str()),
    )?;
    tracing::info!(finding = %finding.id, status = %status, "finding resolved");
    Ok(finding)
}

impl TaskGraph {
    /// Log a finding against the active task's milestone.
    pub fn defer_finding(&self, task: TaskId, category: &str, description: &str) -> Result<DeferredFinding> {
        let (category, description) = (category.trim(), description.trim());
        if category.is_empty() || description.is_empty() {
            return Err(ContractError::Invalid(
                "A finding needs a category and a description".to_string(),
            )
            .into());
        }
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let owner = get_task_in(&tx, task)?;
        if !owner.state.is_active() {
            return Err(ContractError::UnexpectedState {
                task,
                state: owner.state,
                expected: "in_progress or under_review",
            }
            .into());
        }
        let id = store::tasks::insert_finding(&tx, task, &owner.milestone_id, category, description, &Utc::now())?;
        let finding = get_finding_in(&tx, id)?;
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::FINDING_DEFER)
                .input(&(task, category, description))
                .output(&finding)
                .verdict(finding.status.as_str()),
        )?;
        tx.commit()?;
        tracing::info!(finding = %id, task = %task, category, "finding deferred");
        Ok(finding)
    }

    /// Turn a finding into a new task (in an open milestone).
    pub fn promote_finding(&self, id: FindingId, spec: &TaskSpec) -> Result<(DeferredFinding, super::AddTaskOutcome)> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let mut finding = resolvable_in(&tx, id)?;
        let outcome = add_task_in(&tx, spec)?;
        finding.promoted_task = Some(outcome.task.id);
        let finding = close_in(&tx, finding, FindingStatus::Promoted)?;
        tx.commit()?;
        Ok((finding, outcome))
    }

    /// Push the finding past the current plan.
    pub fn defer_again(&self, id: FindingId) -> Result<DeferredFinding> {
        self.close_finding(id, FindingStatus::Deferred)
    }

    pub fn dismiss_finding(&self, id: FindingId) -> Result<DeferredFinding> {
        self.close_finding(id, FindingStatus::Dismissed)
    }

    fn close_finding(&self, id: FindingId, status: FindingStatus) -> Result<DeferredFinding> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let finding = resolvable_in(&tx, id)?;
        let finding = close_in(&tx, finding, status)?;
        tx.commit()?;
        Ok(finding)
    }

    pub fn findings(&self) -> Result<Vec<DeferredFinding>> {
        let guard = self.store.lock_sync()?;
        Ok(store::tasks::list_findings(guard.conn())?)
    }

    /// Open findings whose milestone is complete.
    pub fn eligible_findings(&self) -> Result<Vec<DeferredFinding>> {
        let guard = self.store.lock_sync()?;
        let complete: Vec<MilestoneId> = store::tasks::list_milestones(guard.conn())?
            .into_iter()
            .filter(|m| m.state == MilestoneState::Complete)
            .map(|m| m.id)
            .collect();
        Ok(store::tasks::list_findings(guard.conn())?
            .into_iter()
            .filter(|f| f.status == FindingStatus::Open && complete.contains(&f.milestone_id))
            .collect())
    }
}
