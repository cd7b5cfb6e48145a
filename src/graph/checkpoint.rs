//! Labelled snapshots of task and milestone state, and rollback to them.

use chrono::{DateTime, Utc};
use foreman_common::{MilestoneId, TaskId};
use serde::{Deserialize, Serialize};

use super::{ACTOR, MilestoneState, TaskGraph, TaskState};
use crate::chain::{self, ChainRecord, digest, stage};
use crate::errors::{ContractError, IntegrityFailure, Result};
use crate::events::CoreEvent;
use crate::store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub state: TaskState,
    pub review_cycle_count: u32,
    pub cycle_allowance: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneSnapshot {
    pub id: MilestoneId,
    pub state: MilestoneState,
    pub review_cycle_count: u32,
    #[serde(default)]
    pub cycle_allowance: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub tasks: Vec<TaskSnapshot>,
    pub milestones: Vec<MilestoneSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub label: String,
    /// Chain entry that recorded the checkpoint.
    pub chain_seq: u64,
    pub snapshot: GraphSnapshot,
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub label: String,
    pub digest: String,
    pub restored: Vec<TaskId>,
    /// Tasks created after the checkpoint, now cancelled.
    pub cancelled: Vec<TaskId>,
}

impl TaskGraph {
    pub fn checkpoint(&self, label: &str) -> Result<Checkpoint> {
        let label = label.trim();
        if label.is_empty() || label.chars().any(char::is_whitespace) {
            return Err(ContractError::Invalid(format!(
                "Checkpoint label '{}' must be non-empty and contain no whitespace",
                label
            ))
            .into());
        }
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        if store::tasks::checkpoint_exists(&tx, label)? {
            return Err(ContractError::DuplicateCheckpoint(label.to_string()).into());
        }

        let snapshot = GraphSnapshot {
            tasks: store::tasks::list_tasks(&tx)?
                .into_iter()
                .map(|t| TaskSnapshot {
                    id: t.id,
                    state: t.state,
                    review_cycle_count: t.review_cycle_count,
                    cycle_allowance: t.cycle_allowance,
                })
                .collect(),
            milestones: store::tasks::list_milestones(&tx)?
                .into_iter()
                .map(|m| MilestoneSnapshot {
                    id: m.id,
                    state: m.state,
                    review_cycle_count: m.review_cycle_count,
                    cycle_allowance: m.cycle_allowance,
                    completed_at: m.completed_at,
                })
                .collect(),
        };
        let digest = digest::digest_json(&snapshot)?;
        let entry = chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::GRAPH_CHECKPOINT)
                .input(label)
                .output(&snapshot)
                .verdict("checkpoint"),
        )?;
        let checkpoint = Checkpoint {
            label: label.to_string(),
            chain_seq: entry.sequence_no,
            snapshot,
            digest,
            created_at: Utc::now(),
        };
        store::tasks::insert_checkpoint(&tx, &checkpoint)?;
        tx.commit()?;
        tracing::info!(label, seq = checkpoint.chain_seq, "checkpoint recorded");
        Ok(checkpoint)
    }

    pub fn checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let guard = self.store.lock_sync()?;
        Ok(store::tasks::list_checkpoints(guard.conn())?)
    }

    /// Restore task and milestone states from `label`.
    ///
    /// Refused while the chain fails verification. Tasks added after the
    /// checkpoint are cancelled, never deleted.
    pub fn rollback(&self, label: &str) -> Result<RollbackOutcome> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;

        let report = chain::verify_in(&tx)?;
        if !report.valid {
            return Err(IntegrityFailure::ChainBroken {
                broken: report.broken,
            }
            .into());
        }
        let checkpoint = store::tasks::get_checkpoint(&tx, label)?
            .ok_or_else(|| ContractError::UnknownCheckpoint(label.to_string()))?;
        if digest::digest_json(&checkpoint.snapshot)? != checkpoint.digest {
            return Err(IntegrityFailure::GraphInvariant(format!(
                "checkpoint '{}' does not match its recorded digest",
                label
            ))
            .into());
        }

        let now = Utc::now();
        let mut restored = Vec::new();
        let mut cancelled = Vec::new();
        for mut task in store::tasks::list_tasks(&tx)? {
            match checkpoint.snapshot.tasks.iter().find(|s| s.id == task.id) {
                Some(saved) => {
                    if task.state == saved.state
                        && task.review_cycle_count == saved.review_cycle_count
                        && task.cycle_allowance == saved.cycle_allowance
                    {
                        continue;
                    }
                    task.state = saved.state;
                    task.review_cycle_count = saved.review_cycle_count;
                    task.cycle_allowance = saved.cycle_allowance;
                    if saved.state != TaskState::Done {
                        task.verification = None;
                    }
                    task.updated_at = now;
                    store::tasks::update_task(&tx, &task)?;
                    restored.push(task.id);
                }
                None => {
                    if task.state == TaskState::Cancelled {
                        continue;
                    }
                    task.state = TaskState::Cancelled;
                    task.updated_at = now;
                    store::tasks::update_task(&tx, &task)?;
                    cancelled.push(task.id);
                }
            }
        }
        for mut milestone in store::tasks::list_milestones(&tx)? {
            if let Some(saved) = checkpoint.snapshot.milestones.iter().find(|s| s.id == milestone.id) {
                milestone.state = saved.state;
                milestone.review_cycle_count = saved.review_cycle_count;
                milestone.cycle_allowance = saved.cycle_allowance;
                milestone.completed_at = saved.completed_at;
                store::tasks::update_milestone(&tx, &milestone)?;
            }
        }

        let outcome = RollbackOutcome {
            label: checkpoint.label.clone(),
            digest: checkpoint.digest.clone(),
            restored,
            cancelled,
        };
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::GRAPH_ROLLBACK)
                .input_digest(checkpoint.digest.clone())
                .output(&outcome)
                .verdict("rolled_back"),
        )?;
        tx.commit()?;
        drop(guard);

        tracing::warn!(
            label,
            restored = outcome.restored.len(),
            cancelled = outcome.cancelled.len(),
            "graph rolled back"
        );
        self.events.emit(&CoreEvent::RolledBack {
            label: outcome.label.clone(),
        });
        Ok(outcome)
    }
}
