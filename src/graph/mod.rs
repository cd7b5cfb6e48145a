//! Task graph and state machine.
//!
//! The graph exclusively owns tasks and milestones. Every mutation runs in one
//! SQLite transaction together with its audit-chain entry, so a rejected
//! operation leaves nothing behind.
//!
//! Invariants enforced here:
//! - `depends_on` only references earlier tasks and never forms a cycle
//! - at most one task is `in_progress` or `under_review` at a time
//! - a task never rests in `in_progress` with its review count at the ceiling
//! - `done` requires a passing verification result
//! - a milestone completes only when every contained task is `done`

pub mod checkpoint;
pub mod dag;
pub mod findings;
pub mod generate;
pub mod task;

use std::collections::BTreeSet;

use chrono::Utc;
use foreman_common::{
    AggregateKind, DecisionId, MilestoneId, MilestoneVerdict, TaskId, VerificationResult,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::chain::{self, ChainRecord, digest, stage};
use crate::errors::{ContractError, IntegrityFailure, InvariantViolation, Result};
use crate::events::{CoreEvent, EventBus};
use crate::session;
use crate::store::{self, StoreHandle};
pub use checkpoint::{Checkpoint, GraphSnapshot, RollbackOutcome};
pub use dag::{DagError, DependencyGraph};
pub use findings::{DeferredFinding, FindingStatus};
pub use generate::{CoverageReport, GenerationOutcome, SynthesisPlan};
pub use task::{
    AddTaskOutcome, CriterionKind, Evidence, FileAction, FileScopeEntry, IntegrationCriterion,
    Milestone, MilestoneSpec, MilestoneState, ScopeOverlap, Task, TaskSpec, TaskState,
    VerificationRecord,
};

const ACTOR: &str = "task-graph";

/// Review-cycle ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclePolicy {
    pub max_task_cycles: u32,
    pub max_milestone_cycles: u32,
}

impl Default for CyclePolicy {
    fn default() -> Self {
        Self {
            max_task_cycles: 3,
            max_milestone_cycles: 2,
        }
    }
}

/// Result of sending a task back after a blocking review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixOutcome {
    pub task: Task,
    /// The ceiling was reached and the task is now `blocked`.
    pub escalated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MilestoneOutcome {
    pub milestone: Milestone,
    pub verdict: MilestoneVerdict,
}

/// Problems found by [`TaskGraph::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphReport {
    pub tasks_checked: usize,
    pub violations: Vec<String>,
}

impl GraphReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(IntegrityFailure::GraphInvariant(self.violations.join("; ")).into())
        }
    }
}

#[derive(Serialize)]
struct TransitionInput<'a> {
    task: TaskId,
    from: TaskState,
    to: TaskState,
    evidence: &'a Evidence,
}

// ── Transaction-scoped operations ─────────────────────────────────────

fn get_task_in(conn: &Connection, id: TaskId) -> Result<Task> {
    store::tasks::get_task(conn, id)?.ok_or_else(|| ContractError::UnknownTask(id).into())
}

fn get_milestone_in(conn: &Connection, id: &MilestoneId) -> Result<Milestone> {
    store::tasks::get_milestone(conn, id)?
        .ok_or_else(|| ContractError::UnknownMilestone(id.clone()).into())
}

fn add_milestone_in(conn: &Connection, spec: &MilestoneSpec) -> Result<Milestone> {
    if store::tasks::get_milestone(conn, &spec.id)?.is_some() {
        return Err(ContractError::DuplicateMilestone(spec.id.clone()).into());
    }
    let name = match spec.name.trim() {
        "" => spec.id.to_string(),
        name => name.to_string(),
    };
    let milestone = Milestone {
        id: spec.id.clone(),
        ordinal: store::tasks::next_milestone_ordinal(conn)?,
        name,
        goal: spec.goal.trim().to_string(),
        integration_criteria: spec.integration_criteria.clone(),
        state: MilestoneState::Open,
        review_cycle_count: 0,
        cycle_allowance: 0,
        created_at: Utc::now(),
        completed_at: None,
    };
    store::tasks::insert_milestone(conn, &milestone)?;
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::MILESTONE_ADD)
            .input(spec)
            .output(&milestone)
            .verdict(milestone.state.as_str()),
    )?;
    Ok(milestone)
}

fn ensure_decision_active(conn: &Connection, id: &DecisionId) -> Result<()> {
    let decision = store::decisions::get(conn, id)?
        .ok_or_else(|| ContractError::UnknownDecision(id.clone()))?;
    if decision.status.is_active() {
        Ok(())
    } else {
        Err(ContractError::DecisionNotActive {
            id: id.clone(),
            status: decision.status.to_string(),
        }
        .into())
    }
}

/// Validate and insert one task. Checks run before any write.
fn add_task_in(conn: &Connection, spec: &TaskSpec) -> Result<AddTaskOutcome> {
    let id = match spec.id {
        Some(id) => id,
        None => TaskId::new(store::tasks::max_task_ordinal(conn)? + 1),
    };
    if id.ordinal() == 0 {
        return Err(ContractError::Invalid("Task ordinals start at 1".to_string()).into());
    }
    if store::tasks::get_task(conn, id)?.is_some() {
        return Err(ContractError::DuplicateTask(id).into());
    }
    let title = spec.title.trim();
    if title.is_empty() {
        return Err(ContractError::Invalid(format!("Task {} needs a title", id)).into());
    }

    let milestone = get_milestone_in(conn, &spec.milestone)?;
    if milestone.state == MilestoneState::Complete {
        return Err(ContractError::MilestoneClosed(milestone.id).into());
    }

    if spec.file_scope.is_empty() || spec.file_scope.iter().any(|e| e.path.trim().is_empty()) {
        return Err(ContractError::EmptyFileScope(id).into());
    }

    let depends_on: BTreeSet<TaskId> = spec.depends_on.iter().copied().collect();
    if depends_on.contains(&id) {
        return Err(InvariantViolation::CyclicDependency { cycle: vec![id, id] }.into());
    }
    if let Some(&dependency) = depends_on.iter().find(|dep| **dep > id) {
        return Err(InvariantViolation::ForwardDependency { task: id, dependency }.into());
    }

    let existing = store::tasks::list_tasks(conn)?;
    for &dependency in &depends_on {
        if !existing.iter().any(|t| t.id == dependency) {
            return Err(ContractError::UnknownDependency { task: id, dependency }.into());
        }
    }

    let nodes = existing
        .iter()
        .map(|t| (t.id, &t.depends_on))
        .chain(std::iter::once((id, &depends_on)));
    match DependencyGraph::build(nodes) {
        Ok(_) => {}
        Err(DagError::Cycle(cycle)) => {
            return Err(InvariantViolation::CyclicDependency { cycle }.into());
        }
        Err(DagError::UnknownDependency { task, dependency }) => {
            return Err(ContractError::UnknownDependency { task, dependency }.into());
        }
    }

    let decision_refs: BTreeSet<DecisionId> = spec.decision_refs.iter().cloned().collect();
    for decision in &decision_refs {
        ensure_decision_active(conn, decision)?;
    }

    let mut warnings = Vec::new();
    for other in existing.iter().filter(|t| !t.state.is_closed()) {
        for entry in &spec.file_scope {
            let clash = other
                .file_scope
                .iter()
                .any(|o| o.path == entry.path && o.action == entry.action);
            if clash {
                warnings.push(ScopeOverlap {
                    path: entry.path.clone(),
                    action: entry.action,
                    other_task: other.id,
                });
            }
        }
    }
    for warning in &warnings {
        tracing::warn!(task = %id, overlap = %warning, "file scope overlap");
    }

    let now = Utc::now();
    let task = Task {
        id,
        milestone_id: milestone.id,
        title: title.to_string(),
        depends_on,
        decision_refs,
        file_scope: spec.file_scope.clone(),
        acceptance_criteria: spec.acceptance_criteria.clone(),
        state: TaskState::Pending,
        review_cycle_count: 0,
        cycle_allowance: 0,
        verification: None,
        override_reason: None,
        created_at: now,
        updated_at: now,
    };
    store::tasks::insert_task(conn, &task)?;
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::TASK_ADD)
            .input(spec)
            .output(&task)
            .verdict(task.state.as_str()),
    )?;
    Ok(AddTaskOutcome { task, warnings })
}

fn ensure_slot_free(conn: &Connection, requested: TaskId) -> Result<()> {
    match store::tasks::active_tasks(conn)?
        .into_iter()
        .find(|&active| active != requested)
    {
        Some(active) => Err(InvariantViolation::AnotherTaskActive { active, requested }.into()),
        None => Ok(()),
    }
}

fn pending_dependencies(conn: &Connection, task: &Task) -> Result<Vec<TaskId>> {
    let mut pending = Vec::new();
    for &dep in &task.depends_on {
        let state = store::tasks::get_task(conn, dep)?.map(|t| t.state);
        if state != Some(TaskState::Done) {
            pending.push(dep);
        }
    }
    Ok(pending)
}

fn write_transition(
    conn: &Connection,
    task: &mut Task,
    to: TaskState,
    evidence: &Evidence,
) -> Result<TaskState> {
    let from = task.state;
    task.state = to;
    task.updated_at = Utc::now();
    store::tasks::update_task(conn, task)?;

    let input = TransitionInput {
        task: task.id,
        from,
        to,
        evidence,
    };
    let input_digest = match &evidence.digest {
        Some(digest) => digest.clone(),
        None => digest::digest_json(&input)?,
    };
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::TASK_TRANSITION)
            .input_digest(input_digest)
            .output(&*task)
            .verdict(to.as_str()),
    )?;
    tracing::info!(task = %task.id, %from, %to, "task transition");
    Ok(from)
}

/// Apply one edge of the state machine with every guard that belongs to it.
///
/// `under_review -> in_progress` is only reachable through
/// [`return_for_fix_in`], which owns the cycle count, and
/// `blocked -> in_progress` only with an override reason.
fn transition_in(
    conn: &Connection,
    id: TaskId,
    to: TaskState,
    evidence: &Evidence,
    policy: &CyclePolicy,
    override_reason: Option<&str>,
) -> Result<(Task, TaskState)> {
    let mut task = get_task_in(conn, id)?;
    let from = task.state;
    if !from.can_transition_to(to) {
        return Err(InvariantViolation::IllegalTransition { task: id, from, to }.into());
    }

    match (from, to) {
        (TaskState::Pending, TaskState::InProgress) => {
            session::ensure_not_awaiting_in(conn)?;
            let pending = pending_dependencies(conn, &task)?;
            if !pending.is_empty() {
                return Err(InvariantViolation::DependenciesIncomplete { task: id, pending }.into());
            }
            ensure_slot_free(conn, id)?;
        }
        (TaskState::UnderReview, TaskState::InProgress) => {
            return Err(InvariantViolation::IllegalTransition { task: id, from, to }.into());
        }
        (TaskState::Blocked, TaskState::InProgress) => {
            if override_reason.is_none() {
                return Err(InvariantViolation::IllegalTransition { task: id, from, to }.into());
            }
            ensure_slot_free(conn, id)?;
        }
        (TaskState::UnderReview, TaskState::Done) => {
            if !task.verification_passed() {
                return Err(ContractError::VerificationRequired { task: id }.into());
            }
            let ceiling = task.ceiling(policy.max_task_cycles);
            if task.review_cycle_count >= ceiling && override_reason.is_none() {
                return Err(InvariantViolation::ReviewCeilingExceeded {
                    task: id,
                    cycles: task.review_cycle_count,
                    ceiling,
                }
                .into());
            }
        }
        _ => {}
    }

    if let Some(reason) = override_reason {
        task.override_reason = Some(reason.to_string());
    }
    let from = write_transition(conn, &mut task, to, evidence)?;
    Ok((task, from))
}

fn escalate_in(conn: &Connection, id: TaskId, reason: &str) -> Result<Task> {
    let mut task = get_task_in(conn, id)?;
    if !task.state.can_transition_to(TaskState::Blocked) {
        return Err(InvariantViolation::IllegalTransition {
            task: id,
            from: task.state,
            to: TaskState::Blocked,
        }
        .into());
    }
    write_transition(conn, &mut task, TaskState::Blocked, &Evidence::note(reason))?;
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::TASK_ESCALATION)
            .input(reason)
            .output(&task)
            .verdict("escalated"),
    )?;
    session::raise_in(conn, &format!("task {} escalated: {}", id, reason))?;
    Ok(task)
}

fn return_for_fix_in(
    conn: &Connection,
    id: TaskId,
    evidence: &Evidence,
    policy: &CyclePolicy,
) -> Result<FixOutcome> {
    let mut task = get_task_in(conn, id)?;
    if task.state != TaskState::UnderReview {
        return Err(ContractError::UnexpectedState {
            task: id,
            state: task.state,
            expected: "under_review",
        }
        .into());
    }
    task.review_cycle_count += 1;
    let ceiling = task.ceiling(policy.max_task_cycles);

    if task.review_cycle_count < ceiling {
        write_transition(conn, &mut task, TaskState::InProgress, evidence)?;
        return Ok(FixOutcome {
            task,
            escalated: false,
        });
    }

    write_transition(conn, &mut task, TaskState::Blocked, evidence)?;
    let reason = format!(
        "task {} reached the review ceiling ({}/{})",
        id, task.review_cycle_count, ceiling
    );
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::TASK_ESCALATION)
            .input(&reason)
            .output(&task)
            .verdict("escalated"),
    )?;
    session::raise_in(conn, &reason)?;
    Ok(FixOutcome {
        task,
        escalated: true,
    })
}

fn next_eligible_in(conn: &Connection) -> Result<Option<Task>> {
    let tasks = store::tasks::list_tasks(conn)?;
    for task in &tasks {
        match task.state {
            TaskState::Done | TaskState::Cancelled => continue,
            TaskState::Blocked => return Ok(None),
            TaskState::InProgress | TaskState::UnderReview => return Ok(Some(task.clone())),
            TaskState::Pending => {
                let ready = task.depends_on.iter().all(|dep| {
                    tasks
                        .iter()
                        .any(|t| t.id == *dep && t.state == TaskState::Done)
                });
                if ready {
                    return Ok(Some(task.clone()));
                }
            }
        }
    }
    Ok(None)
}

fn milestone_pending_in(conn: &Connection, id: &MilestoneId) -> Result<Vec<TaskId>> {
    Ok(store::tasks::tasks_in_milestone(conn, id)?
        .into_iter()
        .filter(|t| t.state != TaskState::Done)
        .map(|t| t.id)
        .collect())
}

/// The milestone, if a review cycle may run against it: open, below its
/// ceiling, and every contained task done.
fn reviewable_milestone_in(conn: &Connection, id: &MilestoneId, policy: &CyclePolicy) -> Result<Milestone> {
    let milestone = get_milestone_in(conn, id)?;
    if milestone.state == MilestoneState::Complete {
        return Err(InvariantViolation::MilestoneAlreadyComplete(id.clone()).into());
    }
    if milestone.is_escalated(policy.max_milestone_cycles) {
        return Err(InvariantViolation::MilestoneEscalated {
            milestone: id.clone(),
            cycles: milestone.review_cycle_count,
            ceiling: milestone.ceiling(policy.max_milestone_cycles),
        }
        .into());
    }
    let pending = milestone_pending_in(conn, id)?;
    if !pending.is_empty() {
        return Err(InvariantViolation::MilestoneNotReady {
            milestone: id.clone(),
            pending,
        }
        .into());
    }
    Ok(milestone)
}

fn validate_in(conn: &Connection, policy: &CyclePolicy) -> Result<GraphReport> {
    let tasks = store::tasks::list_tasks(conn)?;
    let milestones = store::tasks::list_milestones(conn)?;
    let mut violations = Vec::new();

    if let Err(err) = DependencyGraph::build(tasks.iter().map(|t| (t.id, &t.depends_on))) {
        violations.push(match err {
            DagError::Cycle(cycle) => format!(
                "dependency cycle {}",
                cycle.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
            ),
            DagError::UnknownDependency { task, dependency } => {
                format!("{} depends on missing task {}", task, dependency)
            }
        });
    }

    for task in &tasks {
        if let Some(dep) = task.depends_on.iter().find(|dep| **dep >= task.id) {
            violations.push(format!("{} depends on later task {}", task.id, dep));
        }
        if !milestones.iter().any(|m| m.id == task.milestone_id) {
            violations.push(format!("{} belongs to missing milestone {}", task.id, task.milestone_id));
        }
        let ceiling = task.ceiling(policy.max_task_cycles);
        if task.state == TaskState::InProgress && task.review_cycle_count >= ceiling {
            violations.push(format!(
                "{} is in_progress with {} review cycles (ceiling {})",
                task.id, task.review_cycle_count, ceiling
            ));
        }
        if task.state == TaskState::Done {
            for dep in &task.depends_on {
                let dep_done = tasks
                    .iter()
                    .any(|t| t.id == *dep && t.state == TaskState::Done);
                if !dep_done {
                    violations.push(format!("{} is done but dependency {} is not", task.id, dep));
                }
            }
        }
    }

    let active: Vec<String> = tasks
        .iter()
        .filter(|t| t.state.is_active())
        .map(|t| t.id.to_string())
        .collect();
    if active.len() > 1 {
        violations.push(format!("more than one active task: {}", active.join(", ")));
    }

    for milestone in milestones.iter().filter(|m| m.state == MilestoneState::Complete) {
        let pending: Vec<String> = tasks
            .iter()
            .filter(|t| t.milestone_id == milestone.id)
            .filter(|t| !matches!(t.state, TaskState::Done | TaskState::Cancelled))
            .map(|t| t.id.to_string())
            .collect();
        if !pending.is_empty() {
            violations.push(format!(
                "milestone {} is complete but contains unfinished tasks: {}",
                milestone.id,
                pending.join(", ")
            ));
        }
    }

    Ok(GraphReport {
        tasks_checked: tasks.len(),
        violations,
    })
}

// ── Handle ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TaskGraph {
    store: StoreHandle,
    policy: CyclePolicy,
    events: EventBus,
}

impl TaskGraph {
    pub fn new(store: StoreHandle, policy: CyclePolicy) -> Self {
        Self {
            store,
            policy,
            events: EventBus::default(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn policy(&self) -> &CyclePolicy {
        &self.policy
    }

    pub fn add_milestone(&self, spec: &MilestoneSpec) -> Result<Milestone> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let milestone = add_milestone_in(&tx, spec)?;
        tx.commit()?;
        tracing::info!(milestone = %milestone.id, "milestone added");
        Ok(milestone)
    }

    /// Validate and insert a task. Overlap warnings are logged and returned.
    pub fn add_task(&self, spec: &TaskSpec) -> Result<AddTaskOutcome> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let outcome = add_task_in(&tx, spec)?;
        tx.commit()?;
        drop(guard);
        tracing::info!(task = %outcome.task.id, milestone = %outcome.task.milestone_id, "task added");
        self.events.emit(&CoreEvent::TaskAdded {
            task: outcome.task.id,
            milestone: outcome.task.milestone_id.clone(),
        });
        Ok(outcome)
    }

    pub fn task(&self, id: TaskId) -> Result<Task> {
        let guard = self.store.lock_sync()?;
        get_task_in(guard.conn(), id)
    }

    pub fn tasks(&self) -> Result<Vec<Task>> {
        let guard = self.store.lock_sync()?;
        Ok(store::tasks::list_tasks(guard.conn())?)
    }

    pub fn milestone(&self, id: &MilestoneId) -> Result<Milestone> {
        let guard = self.store.lock_sync()?;
        get_milestone_in(guard.conn(), id)
    }

    pub fn milestones(&self) -> Result<Vec<Milestone>> {
        let guard = self.store.lock_sync()?;
        Ok(store::tasks::list_milestones(guard.conn())?)
    }

    pub fn milestone_tasks(&self, id: &MilestoneId) -> Result<Vec<Task>> {
        let guard = self.store.lock_sync()?;
        get_milestone_in(guard.conn(), id)?;
        Ok(store::tasks::tasks_in_milestone(guard.conn(), id)?)
    }

    /// The active task if there is one, otherwise the lowest-ordinal pending
    /// task whose dependencies are all done. `None` when the queue is
    /// exhausted or the next task in line is blocked.
    pub fn next_eligible_task(&self) -> Result<Option<Task>> {
        let guard = self.store.lock_sync()?;
        next_eligible_in(guard.conn())
    }

    /// The task currently holding the execution slot.
    pub fn current_task_id(&self) -> Result<Option<TaskId>> {
        let guard = self.store.lock_sync()?;
        Ok(store::tasks::active_tasks(guard.conn())?.into_iter().next())
    }

    /// Move a task along one edge of the state machine.
    ///
    /// `under_review -> in_progress` counts as a fix cycle and is routed
    /// through [`TaskGraph::return_for_fix`]; `blocked -> in_progress` needs
    /// [`TaskGraph::unblock`].
    pub fn transition(&self, id: TaskId, to: TaskState, evidence: Evidence) -> Result<Task> {
        {
            let guard = self.store.lock_sync()?;
            let current = get_task_in(guard.conn(), id)?;
            if current.state == TaskState::UnderReview && to == TaskState::InProgress {
                drop(guard);
                return self.return_for_fix(id, evidence).map(|outcome| outcome.task);
            }
        }
        self.apply_transition(id, to, &evidence, None)
    }

    pub fn start(&self, id: TaskId) -> Result<Task> {
        self.apply_transition(id, TaskState::InProgress, &Evidence::none(), None)
    }

    pub fn submit_for_review(&self, id: TaskId, evidence: Evidence) -> Result<Task> {
        self.apply_transition(id, TaskState::UnderReview, &evidence, None)
    }

    /// `under_review -> done`. An override reason lifts the cycle ceiling
    /// check and is recorded on the task.
    pub fn complete(&self, id: TaskId, evidence: Evidence, override_reason: Option<&str>) -> Result<Task> {
        if let Some(reason) = override_reason {
            if reason.trim().is_empty() {
                return Err(ContractError::Invalid("An override needs a reason".to_string()).into());
            }
        }
        self.apply_transition(id, TaskState::Done, &evidence, override_reason)
    }

    pub fn cancel(&self, id: TaskId, reason: &str) -> Result<Task> {
        self.apply_transition(id, TaskState::Cancelled, &Evidence::note(reason), None)
    }

    fn apply_transition(
        &self,
        id: TaskId,
        to: TaskState,
        evidence: &Evidence,
        override_reason: Option<&str>,
    ) -> Result<Task> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let (task, from) = transition_in(&tx, id, to, evidence, &self.policy, override_reason)?;
        tx.commit()?;
        drop(guard);
        self.events.emit(&CoreEvent::TaskTransitioned { task: id, from, to });
        Ok(task)
    }

    /// Count a blocking review: back to `in_progress`, or `blocked` plus an
    /// escalation entry once the count reaches the ceiling.
    pub fn return_for_fix(&self, id: TaskId, evidence: Evidence) -> Result<FixOutcome> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let outcome = return_for_fix_in(&tx, id, &evidence, &self.policy)?;
        tx.commit()?;
        drop(guard);

        self.events.emit(&CoreEvent::TaskTransitioned {
            task: id,
            from: TaskState::UnderReview,
            to: outcome.task.state,
        });
        if outcome.escalated {
            tracing::warn!(
                task = %id,
                cycles = outcome.task.review_cycle_count,
                "review ceiling reached; task blocked"
            );
            self.events.emit(&CoreEvent::TaskEscalated {
                task: id,
                reason: "review ceiling reached".to_string(),
            });
        }
        Ok(outcome)
    }

    /// Operator-initiated escalation of the active task.
    pub fn escalate(&self, id: TaskId, reason: &str) -> Result<Task> {
        if reason.trim().is_empty() {
            return Err(ContractError::Invalid("Blocking a task needs a reason".to_string()).into());
        }
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let from = get_task_in(&tx, id)?.state;
        let task = escalate_in(&tx, id, reason)?;
        tx.commit()?;
        drop(guard);
        tracing::warn!(task = %id, reason, "task escalated");
        self.events.emit(&CoreEvent::TaskTransitioned {
            task: id,
            from,
            to: TaskState::Blocked,
        });
        self.events.emit(&CoreEvent::TaskEscalated {
            task: id,
            reason: reason.to_string(),
        });
        Ok(task)
    }

    /// Explicit human override: `blocked -> in_progress` with one more full
    /// ceiling of review cycles.
    pub fn unblock(&self, id: TaskId, reason: &str) -> Result<Task> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ContractError::Invalid("An override needs a reason".to_string()).into());
        }
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let mut task = get_task_in(&tx, id)?;
        if task.state != TaskState::Blocked {
            return Err(ContractError::UnexpectedState {
                task: id,
                state: task.state,
                expected: "blocked",
            }
            .into());
        }
        task.cycle_allowance += self.policy.max_task_cycles;
        store::tasks::update_task(&tx, &task)?;
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::TASK_OVERRIDE)
                .input(reason)
                .output(&task)
                .verdict("override"),
        )?;
        let (task, from) = transition_in(
            &tx,
            id,
            TaskState::InProgress,
            &Evidence::note(reason),
            &self.policy,
            Some(reason),
        )?;
        tx.commit()?;
        drop(guard);
        tracing::info!(task = %id, allowance = task.cycle_allowance, "task unblocked by override");
        self.events.emit(&CoreEvent::TaskTransitioned {
            task: id,
            from,
            to: TaskState::InProgress,
        });
        Ok(task)
    }

    /// Store the latest verification outcome for the active task.
    pub fn record_verification(&self, id: TaskId, result: &VerificationResult) -> Result<Task> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let mut task = get_task_in(&tx, id)?;
        if !task.state.is_active() {
            return Err(ContractError::UnexpectedState {
                task: id,
                state: task.state,
                expected: "in_progress or under_review",
            }
            .into());
        }
        let output_digest = digest::digest_str(&result.output);
        task.verification = Some(VerificationRecord {
            passed: result.passed,
            output_digest: output_digest.clone(),
            recorded_at: Utc::now(),
        });
        task.updated_at = Utc::now();
        store::tasks::update_task(&tx, &task)?;
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::TASK_VERIFICATION)
                .input_digest(output_digest)
                .output(&task.verification)
                .verdict(if result.passed { "pass" } else { "fail" }),
        )?;
        tx.commit()?;
        tracing::info!(task = %id, passed = result.passed, "verification recorded");
        Ok(task)
    }

    /// Tasks still keeping `id` from its integration review.
    pub fn milestone_pending(&self, id: &MilestoneId) -> Result<Vec<TaskId>> {
        let guard = self.store.lock_sync()?;
        get_milestone_in(guard.conn(), id)?;
        milestone_pending_in(guard.conn(), id)
    }

    /// The milestone, if it is open, below its review ceiling, and every
    /// task in it is done.
    pub fn ready_milestone(&self, id: &MilestoneId) -> Result<Milestone> {
        let guard = self.store.lock_sync()?;
        reviewable_milestone_in(guard.conn(), id, &self.policy)
    }

    /// Explicit human override of a `BLOCKED` milestone: one more full
    /// ceiling of review cycles. The escalation itself is never lifted
    /// automatically.
    pub fn unblock_milestone(&self, id: &MilestoneId, reason: &str) -> Result<Milestone> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ContractError::Invalid("An override needs a reason".to_string()).into());
        }
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let mut milestone = get_milestone_in(&tx, id)?;
        if !milestone.is_escalated(self.policy.max_milestone_cycles) {
            return Err(ContractError::Invalid(format!(
                "Milestone {} is not escalated ({} of {} review cycles used)",
                id,
                milestone.review_cycle_count,
                milestone.ceiling(self.policy.max_milestone_cycles)
            ))
            .into());
        }
        milestone.cycle_allowance += self.policy.max_milestone_cycles;
        store::tasks::update_milestone(&tx, &milestone)?;
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::MILESTONE_OVERRIDE)
                .input(reason)
                .output(&milestone)
                .verdict("override"),
        )?;
        tx.commit()?;
        tracing::info!(milestone = %id, allowance = milestone.cycle_allowance, "milestone unblocked by override");
        Ok(milestone)
    }

    /// Apply an aggregate milestone review.
    ///
    /// PASS and CONCERN complete the milestone. BLOCK counts a cycle; at the
    /// milestone ceiling the verdict is `BLOCKED`, which is always escalated
    /// and refuses further cycles until [`unblock_milestone`](Self::unblock_milestone).
    pub fn apply_milestone_review(&self, id: &MilestoneId, aggregate: AggregateKind) -> Result<MilestoneOutcome> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let mut milestone = reviewable_milestone_in(&tx, id, &self.policy)?;

        let verdict = if aggregate.allows_progression() {
            milestone.state = MilestoneState::Complete;
            milestone.completed_at = Some(Utc::now());
            MilestoneVerdict::MilestoneComplete
        } else {
            milestone.review_cycle_count += 1;
            if milestone.is_escalated(self.policy.max_milestone_cycles) {
                MilestoneVerdict::Blocked
            } else {
                MilestoneVerdict::NeedsFix
            }
        };
        store::tasks::update_milestone(&tx, &milestone)?;
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::MILESTONE_REVIEW)
                .input(&aggregate)
                .output(&milestone)
                .verdict(verdict.as_str()),
        )?;
        if verdict == MilestoneVerdict::Blocked {
            let reason = format!(
                "milestone {} blocked after {} review cycle(s)",
                id, milestone.review_cycle_count
            );
            chain::append_in(
                &tx,
                ChainRecord::new(ACTOR, stage::MILESTONE_ESCALATION)
                    .input(&reason)
                    .output(&milestone)
                    .verdict("escalated"),
            )?;
            session::raise_in(&tx, &reason)?;
        }
        tx.commit()?;
        drop(guard);

        match verdict {
            MilestoneVerdict::MilestoneComplete => tracing::info!(milestone = %id, "milestone complete"),
            MilestoneVerdict::NeedsFix => tracing::info!(milestone = %id, "milestone needs fixes"),
            MilestoneVerdict::Blocked => tracing::warn!(milestone = %id, "milestone blocked; operator input required"),
        }
        self.events.emit(&CoreEvent::MilestoneReviewed {
            milestone: id.clone(),
            verdict,
        });
        Ok(MilestoneOutcome { milestone, verdict })
    }

    /// Re-check the persisted graph.
    pub fn validate(&self) -> Result<GraphReport> {
        let guard = self.store.lock_sync()?;
        validate_in(guard.conn(), &self.policy)
    }
}
