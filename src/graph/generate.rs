//! Compile a synthesis plan into milestones and tasks.
//!
//! Generation sits behind the deconfliction gate: no task is written while a
//! decision conflict lacks a resolution. The whole plan is applied in one
//! transaction.

use std::collections::BTreeSet;

use foreman_common::DecisionId;
use serde::{Deserialize, Serialize};

use super::{ACTOR, Milestone, MilestoneSpec, ScopeOverlap, Task, TaskGraph, TaskSpec, add_milestone_in, add_task_in};
use crate::chain::{self, ChainRecord, stage};
use crate::decision::DecisionStore;
use crate::errors::{ContractError, Result};
use crate::events::CoreEvent;
use crate::store;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisPlan {
    #[serde(default)]
    pub milestones: Vec<MilestoneSpec>,
    pub tasks: Vec<TaskSpec>,
}

impl SynthesisPlan {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ContractError::InvalidPlan(e.to_string()).into())
    }
}

/// What the generated graph leaves uncovered. Warnings only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    /// Active decisions referenced by no task.
    pub uncovered_decisions: Vec<DecisionId>,
    /// Concern clusters none of whose decisions is referenced by a task.
    pub uncovered_concerns: Vec<String>,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.uncovered_decisions.is_empty() && self.uncovered_concerns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationOutcome {
    pub milestones: Vec<Milestone>,
    pub tasks: Vec<Task>,
    pub warnings: Vec<ScopeOverlap>,
    pub coverage: CoverageReport,
}

impl TaskGraph {
    pub fn generate(&self, decisions: &DecisionStore, plan: &SynthesisPlan) -> Result<GenerationOutcome> {
        if plan.tasks.is_empty() {
            return Err(ContractError::InvalidPlan("the plan contains no tasks".to_string()).into());
        }
        let report = decisions.ensure_deconflicted()?;

        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;

        let mut milestones = Vec::with_capacity(plan.milestones.len());
        for spec in &plan.milestones {
            milestones.push(add_milestone_in(&tx, spec)?);
        }
        let mut tasks = Vec::with_capacity(plan.tasks.len());
        let mut warnings = Vec::new();
        for spec in &plan.tasks {
            let outcome = add_task_in(&tx, spec)?;
            warnings.extend(outcome.warnings);
            tasks.push(outcome.task);
        }

        let referenced: BTreeSet<DecisionId> = store::tasks::list_tasks(&tx)?
            .into_iter()
            .flat_map(|t| t.decision_refs)
            .collect();
        let active: BTreeSet<DecisionId> = store::decisions::list(&tx)?
            .into_iter()
            .filter(|d| d.status.is_active())
            .map(|d| d.id)
            .collect();
        let coverage = CoverageReport {
            uncovered_decisions: active.difference(&referenced).cloned().collect(),
            uncovered_concerns: report
                .index
                .iter()
                .filter(|(_, ids)| !ids.iter().any(|id| referenced.contains(id)))
                .map(|(concern, _)| concern.clone())
                .collect(),
        };

        let summary = (
            milestones.iter().map(|m| &m.id).collect::<Vec<_>>(),
            tasks.iter().map(|t| t.id).collect::<Vec<_>>(),
            &coverage,
        );
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::TASK_GENERATE)
                .input(plan)
                .output(&summary)
                .verdict("generated"),
        )?;
        tx.commit()?;
        drop(guard);

        for id in &coverage.uncovered_decisions {
            tracing::warn!(decision = %id, "decision not referenced by any task");
        }
        for concern in &coverage.uncovered_concerns {
            tracing::warn!(concern = %concern, "concern area has no covering task");
        }
        tracing::info!(milestones = milestones.len(), tasks = tasks.len(), "task graph generated");
        for task in &tasks {
            self.events.emit(&CoreEvent::TaskAdded {
                task: task.id,
                milestone: task.milestone_id.clone(),
            });
        }

        Ok(GenerationOutcome {
            milestones,
            tasks,
            warnings,
            coverage,
        })
    }
}
