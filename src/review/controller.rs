//! The review-cycle controller.
//!
//! Manual flow (one CLI call per step): [`ReviewController::begin_cycle`],
//! then [`ReviewController::record_review`] once per reviewer, then
//! [`ReviewController::adjudicate`]. [`ReviewController::run_cycle`] does the
//! same with the configured reviewers, invoked concurrently under a timeout
//! with at most one retry each.
//!
//! Cycle numbers come from closed adjudications, not from the task's fix
//! count: a cycle closes when its aggregate is written, so a cycle that ends
//! in escalation never shares a number with the next one.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use foreman_common::{
    AggregateKind, MilestoneId, MilestoneVerdict, ReviewRequest, ReviewResponse, ReviewSubject,
    ReviewVerdict, Reviewer, TaskId,
};
use futures::future::join_all;
use rusqlite::Connection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::selection::{Selection, select, select_for_milestone};
use super::{Adjudication, AggregateVerdict, ReviewGap, ReviewPolicy, ReviewRecord, aggregate};
use crate::chain::{self, ChainRecord, digest, stage};
use crate::errors::{CollaboratorUnavailable, ContractError, InvariantViolation, Result};
use crate::events::{CoreEvent, EventBus};
use crate::graph::{Evidence, Milestone, MilestoneState, Task, TaskGraph, TaskState};
use crate::session;
use crate::store::{self, StoreHandle};
use crate::telemetry::{EvalOutcome, EvalRecord, Lesson, Telemetry};

const ACTOR: &str = "review-controller";

/// An open review cycle for a task.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewCycle {
    pub task: Task,
    pub cycle: u32,
    pub request: ReviewRequest,
    /// Configured reviewers expected to answer.
    pub reviewers: Vec<String>,
    pub gaps: Vec<ReviewGap>,
    /// Past lessons sharing a concern tag with the task. Only looked up for
    /// the first cycle.
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReviewOutcome {
    pub aggregate: AggregateVerdict,
    pub task: Task,
    /// The task ended the cycle `blocked`.
    pub escalated: bool,
}

/// A task just moved to `in_progress`, with the lessons to read first.
#[derive(Debug, Clone, Serialize)]
pub struct StartedTask {
    #[serde(flatten)]
    pub task: Task,
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MilestoneReviewOutcome {
    pub aggregate: AggregateVerdict,
    pub milestone: Milestone,
    pub verdict: MilestoneVerdict,
}

/// What came back from one reviewer across its attempts.
struct Invocation {
    reviewer_id: String,
    failures: Vec<String>,
    response: Option<ReviewResponse>,
}

async fn invoke(
    reviewer: Arc<dyn Reviewer>,
    request: &ReviewRequest,
    timeout: Duration,
    retries: u32,
    cancel: &CancellationToken,
) -> Invocation {
    let mut failures = Vec::new();
    for attempt in 0..=retries.min(1) {
        if attempt > 0 && cancel.is_cancelled() {
            break;
        }
        let reason = match tokio::time::timeout(timeout, reviewer.review(request)).await {
            Ok(Ok(response)) if response.verdict.is_available() => {
                return Invocation {
                    reviewer_id: reviewer.id().to_string(),
                    failures,
                    response: Some(response),
                };
            }
            Ok(Ok(_)) => "reviewer reported itself unavailable".to_string(),
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("timed out after {}ms", timeout.as_millis()),
        };
        tracing::warn!(
            reviewer = reviewer.id(),
            attempt = attempt + 1,
            %reason,
            "reviewer unavailable"
        );
        failures.push(reason);
    }
    Invocation {
        reviewer_id: reviewer.id().to_string(),
        failures,
        response: None,
    }
}

/// The cycle currently open for `subject`, after checking the subject can
/// take reviews.
fn open_cycle_in(conn: &Connection, subject: &ReviewSubject) -> Result<u32> {
    match subject {
        ReviewSubject::Task(id) => {
            let task = store::tasks::get_task(conn, *id)?.ok_or(ContractError::UnknownTask(*id))?;
            if task.state != TaskState::UnderReview {
                return Err(ContractError::UnexpectedState {
                    task: *id,
                    state: task.state,
                    expected: "under_review",
                }
                .into());
            }
        }
        ReviewSubject::Milestone(id) => {
            let milestone = store::tasks::get_milestone(conn, id)?
                .ok_or_else(|| ContractError::UnknownMilestone(id.clone()))?;
            if milestone.state == MilestoneState::Complete {
                return Err(InvariantViolation::MilestoneAlreadyComplete(id.clone()).into());
            }
        }
    }
    Ok(store::reviews::last_closed_cycle(conn, subject)? + 1)
}

fn record_in(
    conn: &Connection,
    subject: &ReviewSubject,
    cycle: u32,
    reviewer_id: &str,
    response: &ReviewResponse,
) -> Result<ReviewRecord> {
    if store::reviews::exists(conn, subject, cycle, reviewer_id)? {
        return Err(ContractError::DuplicateReview {
            subject: subject.to_string(),
            reviewer: reviewer_id.to_string(),
            cycle,
        }
        .into());
    }
    let entry = chain::append_in(
        conn,
        ChainRecord::new(reviewer_id, stage::REVIEW_INVOCATION)
            .input(&(subject, cycle))
            .output(response)
            .verdict(response.verdict.as_str()),
    )?;
    let record = ReviewRecord {
        subject: subject.clone(),
        cycle,
        reviewer_id: reviewer_id.to_string(),
        verdict: response.verdict,
        findings: response.findings.clone(),
        chain_seq: entry.sequence_no,
        created_at: Utc::now(),
    };
    store::reviews::insert(conn, &record)?;
    Ok(record)
}

#[derive(Clone)]
pub struct ReviewController {
    store: StoreHandle,
    graph: TaskGraph,
    telemetry: Telemetry,
    reviewers: Vec<Arc<dyn Reviewer>>,
    policy: ReviewPolicy,
    events: EventBus,
}

impl ReviewController {
    pub fn new(store: StoreHandle, graph: TaskGraph, telemetry: Telemetry) -> Self {
        Self {
            store,
            graph,
            telemetry,
            reviewers: Vec::new(),
            policy: ReviewPolicy::default(),
            events: EventBus::default(),
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewers.push(reviewer);
        self
    }

    pub fn with_reviewers(mut self, reviewers: impl IntoIterator<Item = Arc<dyn Reviewer>>) -> Self {
        self.reviewers.extend(reviewers);
        self
    }

    pub fn with_policy(mut self, policy: ReviewPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn reviewers(&self) -> &[Arc<dyn Reviewer>] {
        &self.reviewers
    }

    /// `pending -> in_progress`, then the lessons sharing a concern tag with
    /// the task's decisions.
    pub fn start_task(&self, id: TaskId) -> Result<StartedTask> {
        let task = self.graph.start(id)?;
        let lessons = self.lessons_for(&task);
        for lesson in &lessons {
            tracing::info!(task = %id, lesson = lesson.id, summary = %lesson.summary, "relevant lesson");
        }
        Ok(StartedTask { task, lessons })
    }

    // ── Manual cycle ──────────────────────────────────────────────────

    /// Open (or continue) the review cycle for a task.
    ///
    /// An `in_progress` task is submitted for review. On the first cycle the
    /// session must not be awaiting input, and lessons tagged with the task's
    /// concern areas are looked up.
    pub fn begin_cycle(&self, id: TaskId, verification_output: Option<&str>) -> Result<ReviewCycle> {
        let task = self.graph.task(id)?;
        let subject = ReviewSubject::Task(id);
        let mut lessons = Vec::new();

        let task = match task.state {
            TaskState::UnderReview => task,
            TaskState::InProgress => {
                let first = {
                    let guard = self.store.lock_sync()?;
                    store::reviews::last_closed_cycle(guard.conn(), &subject)? == 0
                };
                if first {
                    {
                        let guard = self.store.lock_sync()?;
                        session::ensure_not_awaiting_in(guard.conn())?;
                    }
                    lessons = self.lessons_for(&task);
                }
                let evidence = match verification_output {
                    Some(output) => Evidence::digest(digest::digest_str(output)),
                    None => Evidence::note("submitted for review"),
                };
                self.graph.submit_for_review(id, evidence)?
            }
            state => {
                return Err(ContractError::UnexpectedState {
                    task: id,
                    state,
                    expected: "in_progress or under_review",
                }
                .into());
            }
        };

        let cycle = {
            let guard = self.store.lock_sync()?;
            open_cycle_in(guard.conn(), &subject)?
        };
        let selection = self.task_selection(&task);
        for lesson in &lessons {
            tracing::info!(task = %id, lesson = lesson.id, summary = %lesson.summary, "relevant lesson");
        }
        tracing::info!(task = %id, cycle, reviewers = ?selection.ids(), "review cycle open");

        Ok(ReviewCycle {
            request: ReviewRequest {
                subject,
                cycle,
                changed_files: task.paths().map(str::to_string).collect(),
                decision_refs: task.decision_refs.iter().cloned().collect(),
                verification_output: verification_output.map(str::to_string),
            },
            reviewers: selection.ids(),
            gaps: selection.gaps,
            lessons,
            cycle,
            task,
        })
    }

    /// Store one reviewer's verdict for the open cycle of `subject`.
    pub fn record_review(
        &self,
        subject: &ReviewSubject,
        reviewer_id: &str,
        response: ReviewResponse,
    ) -> Result<ReviewRecord> {
        let reviewer_id = reviewer_id.trim();
        if reviewer_id.is_empty() {
            return Err(ContractError::Invalid("A review needs a reviewer id".to_string()).into());
        }
        if let ReviewSubject::Milestone(id) = subject {
            self.ready_milestone(id)?;
        }
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let cycle = open_cycle_in(&tx, subject)?;
        let record = record_in(&tx, subject, cycle, reviewer_id, &response)?;
        tx.commit()?;
        tracing::info!(
            subject = %subject,
            cycle,
            reviewer = reviewer_id,
            verdict = %record.verdict,
            findings = record.findings.len(),
            "review recorded"
        );
        Ok(record)
    }

    /// Close the open cycle of a task and apply the aggregate.
    ///
    /// BLOCK returns the task for a fix (or blocks it at the ceiling).
    /// PASS and CONCERN complete it, which needs a passing verification; if
    /// that is missing nothing is written and the cycle stays open.
    pub fn adjudicate(&self, id: TaskId) -> Result<TaskReviewOutcome> {
        let task = self.graph.task(id)?;
        let selection = self.task_selection(&task);
        let subject = ReviewSubject::Task(id);

        let aggregate = {
            let mut guard = self.store.lock_sync()?;
            let tx = guard.transaction()?;
            let cycle = open_cycle_in(&tx, &subject)?;
            let aggregate = self.close_cycle_in(&tx, &subject, cycle, &selection)?;
            if aggregate.kind.allows_progression() && aggregate.has_verdicts() && !task.verification_passed() {
                return Err(ContractError::VerificationRequired { task: id }.into());
            }
            tx.commit()?;
            aggregate
        };
        self.announce(&aggregate);

        let evidence = Evidence::digest(digest::digest_json(&aggregate)?);
        let (task, escalated) = match aggregate.kind {
            AggregateKind::Block => {
                let fix = self.graph.return_for_fix(id, evidence)?;
                (fix.task, fix.escalated)
            }
            _ if !aggregate.has_verdicts() => {
                let reason = format!("no reviewer produced a verdict for cycle {}", aggregate.cycle);
                (self.graph.escalate(id, &reason)?, true)
            }
            _ => (self.graph.complete(id, evidence, None)?, false),
        };
        self.record_eval(&task, &aggregate);
        Ok(TaskReviewOutcome {
            aggregate,
            task,
            escalated,
        })
    }

    // ── Automated cycle ───────────────────────────────────────────────

    /// Run one full review cycle with the configured reviewers.
    ///
    /// When `cancel` fires, reviewer calls already in flight finish and are
    /// recorded, no retries start, and the task is blocked instead of
    /// adjudicated.
    pub async fn run_cycle(
        &self,
        id: TaskId,
        verification_output: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TaskReviewOutcome> {
        self.ensure_reviewers()?;
        let cycle = self.begin_cycle(id, verification_output)?;
        let selection = self.task_selection(&cycle.task);
        let pending = self.unrecorded(&cycle.request.subject, cycle.cycle, &selection.reviewers)?;

        let invocations = self.invoke_all(&pending, &cycle.request, cancel).await;
        self.store_invocations(&cycle.request, &invocations)?;

        if cancel.is_cancelled() {
            return self.abandon(id, &selection);
        }
        self.adjudicate(id)
    }

    fn abandon(&self, id: TaskId, selection: &Selection) -> Result<TaskReviewOutcome> {
        let subject = ReviewSubject::Task(id);
        let aggregate = {
            let mut guard = self.store.lock_sync()?;
            let tx = guard.transaction()?;
            let cycle = open_cycle_in(&tx, &subject)?;
            let aggregate = self.close_cycle_in(&tx, &subject, cycle, selection)?;
            tx.commit()?;
            aggregate
        };
        self.announce(&aggregate);
        let task = self.graph.escalate(id, "review cycle cancelled")?;
        self.record_eval(&task, &aggregate);
        Ok(TaskReviewOutcome {
            aggregate,
            task,
            escalated: true,
        })
    }

    // ── Milestones ────────────────────────────────────────────────────

    /// Integration review of a milestone whose tasks are all done.
    pub async fn run_milestone_review(
        &self,
        id: &MilestoneId,
        cancel: &CancellationToken,
    ) -> Result<MilestoneReviewOutcome> {
        self.ensure_reviewers()?;
        let milestone = self.ready_milestone(id)?;
        let subject = ReviewSubject::Milestone(id.clone());
        let cycle = {
            let guard = self.store.lock_sync()?;
            open_cycle_in(guard.conn(), &subject)?
        };
        let tasks = self.graph.milestone_tasks(id)?;
        let changed_files: BTreeSet<String> = tasks
            .iter()
            .flat_map(|t| t.paths().map(str::to_string))
            .collect();
        let decision_refs: BTreeSet<_> = tasks.iter().flat_map(|t| t.decision_refs.iter().cloned()).collect();
        let request = ReviewRequest {
            subject: subject.clone(),
            cycle,
            changed_files: changed_files.into_iter().collect(),
            decision_refs: decision_refs.into_iter().collect(),
            verification_output: None,
        };
        tracing::info!(milestone = %milestone.id, cycle, "milestone review started");

        let selection = select_for_milestone(&self.reviewers);
        let pending = self.unrecorded(&subject, cycle, &selection.reviewers)?;
        let invocations = self.invoke_all(&pending, &request, cancel).await;
        self.store_invocations(&request, &invocations)?;

        if cancel.is_cancelled() {
            return Err(ContractError::Invalid(format!(
                "Milestone review of {} was cancelled; verdicts were kept and nothing was applied",
                id
            ))
            .into());
        }
        self.adjudicate_milestone(id)
    }

    /// Close the open milestone cycle and apply it to the graph.
    pub fn adjudicate_milestone(&self, id: &MilestoneId) -> Result<MilestoneReviewOutcome> {
        self.ready_milestone(id)?;
        let selection = select_for_milestone(&self.reviewers);
        let subject = ReviewSubject::Milestone(id.clone());
        let aggregate = {
            let mut guard = self.store.lock_sync()?;
            let tx = guard.transaction()?;
            let cycle = open_cycle_in(&tx, &subject)?;
            let aggregate = self.close_cycle_in(&tx, &subject, cycle, &selection)?;
            tx.commit()?;
            aggregate
        };
        self.announce(&aggregate);

        if !aggregate.has_verdicts() {
            return Err(CollaboratorUnavailable::Reviewer {
                reviewer: aggregate.gap_names().join(", "),
                reason: format!("no milestone reviewer produced a verdict for cycle {}", aggregate.cycle),
            }
            .into());
        }
        let outcome = self.graph.apply_milestone_review(id, aggregate.kind)?;
        Ok(MilestoneReviewOutcome {
            aggregate,
            milestone: outcome.milestone,
            verdict: outcome.verdict,
        })
    }

    /// The milestone, if a review cycle may run against it.
    pub fn ready_milestone(&self, id: &MilestoneId) -> Result<Milestone> {
        self.graph.ready_milestone(id)
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn records(&self, subject: &ReviewSubject) -> Result<Vec<ReviewRecord>> {
        let guard = self.store.lock_sync()?;
        Ok(store::reviews::for_subject(guard.conn(), subject)?)
    }

    pub fn adjudications(&self, subject: &ReviewSubject) -> Result<Vec<Adjudication>> {
        let guard = self.store.lock_sync()?;
        Ok(store::reviews::adjudications(guard.conn(), subject)?)
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn ensure_reviewers(&self) -> Result<()> {
        if self.reviewers.is_empty() {
            return Err(ContractError::Invalid(
                "No reviewers configured; add [[reviewers]] to foreman.toml or record verdicts with `foreman review-record`"
                    .to_string(),
            )
            .into());
        }
        Ok(())
    }

    fn task_selection(&self, task: &Task) -> Selection {
        let paths: Vec<&str> = task.paths().collect();
        select(&self.reviewers, &self.policy.routing.required_roles(&paths))
    }

    /// Missing roles and silent reviewers. With no reviewers configured the
    /// operator is the reviewer and coverage is not checked.
    fn coverage_gaps(&self, selection: &Selection, records: &[ReviewRecord]) -> Vec<ReviewGap> {
        if self.reviewers.is_empty() {
            return Vec::new();
        }
        let mut gaps = selection.gaps.clone();
        for id in selection.ids() {
            if !records.iter().any(|r| r.reviewer_id == id) {
                gaps.push(ReviewGap::missing(id));
            }
        }
        gaps
    }

    /// Aggregate the open cycle and write it to the chain and the store.
    fn close_cycle_in(
        &self,
        conn: &Connection,
        subject: &ReviewSubject,
        cycle: u32,
        selection: &Selection,
    ) -> Result<AggregateVerdict> {
        let records = store::reviews::for_cycle(conn, subject, cycle)?;
        if records.is_empty() {
            return Err(ContractError::Invalid(format!(
                "No review records for {} cycle {}; record at least one verdict first",
                subject, cycle
            ))
            .into());
        }
        let gaps = self.coverage_gaps(selection, &records);
        let aggregate = aggregate(subject.clone(), cycle, records, gaps);

        let inputs: Vec<(&str, ReviewVerdict, u64)> = aggregate
            .records
            .iter()
            .map(|r| (r.reviewer_id.as_str(), r.verdict, r.chain_seq))
            .collect();
        let entry = chain::append_in(
            conn,
            ChainRecord::new(ACTOR, stage::REVIEW_AGGREGATE)
                .input(&inputs)
                .output(&aggregate)
                .verdict(aggregate.kind.as_str()),
        )?;
        store::reviews::insert_adjudication(
            conn,
            &Adjudication {
                subject: subject.clone(),
                cycle,
                kind: aggregate.kind,
                degraded: aggregate.degraded,
                gaps: aggregate.gaps.clone(),
                chain_seq: entry.sequence_no,
                created_at: Utc::now(),
            },
        )?;
        Ok(aggregate)
    }

    fn announce(&self, aggregate: &AggregateVerdict) {
        if aggregate.gaps.is_empty() {
            tracing::info!(
                subject = %aggregate.subject,
                cycle = aggregate.cycle,
                verdict = %aggregate.kind,
                "review aggregated"
            );
        } else {
            tracing::warn!(
                subject = %aggregate.subject,
                cycle = aggregate.cycle,
                verdict = %aggregate.kind,
                gaps = ?aggregate.gap_names(),
                "review aggregated with gaps"
            );
        }
        self.events.emit(&CoreEvent::ReviewAggregated {
            subject: aggregate.subject.clone(),
            cycle: aggregate.cycle,
            verdict: aggregate.kind,
            gaps: aggregate.gap_names(),
        });
    }

    fn unrecorded(
        &self,
        subject: &ReviewSubject,
        cycle: u32,
        reviewers: &[Arc<dyn Reviewer>],
    ) -> Result<Vec<Arc<dyn Reviewer>>> {
        let guard = self.store.lock_sync()?;
        let mut pending = Vec::new();
        for reviewer in reviewers {
            if !store::reviews::exists(guard.conn(), subject, cycle, reviewer.id())? {
                pending.push(reviewer.clone());
            }
        }
        Ok(pending)
    }

    async fn invoke_all(
        &self,
        reviewers: &[Arc<dyn Reviewer>],
        request: &ReviewRequest,
        cancel: &CancellationToken,
    ) -> Vec<Invocation> {
        let timeout = self.policy.reviewer_timeout;
        let retries = self.policy.retry_unavailable;
        let calls = reviewers
            .iter()
            .map(|reviewer| invoke(reviewer.clone(), request, timeout, retries, cancel));
        if self.policy.parallel {
            join_all(calls).await
        } else {
            let mut invocations = Vec::with_capacity(reviewers.len());
            for call in calls {
                invocations.push(call.await);
            }
            invocations
        }
    }

    /// One chain entry per failed attempt, then one record per reviewer.
    fn store_invocations(&self, request: &ReviewRequest, invocations: &[Invocation]) -> Result<()> {
        let request_digest = digest::digest_json(request)?;
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        for invocation in invocations {
            for (attempt, reason) in invocation.failures.iter().enumerate() {
                chain::append_in(
                    &tx,
                    ChainRecord::new(invocation.reviewer_id.as_str(), stage::REVIEW_UNAVAILABLE)
                        .input_digest(request_digest.clone())
                        .output(&(attempt + 1, reason))
                        .verdict(ReviewVerdict::Unavailable.as_str()),
                )?;
            }
            let response = invocation
                .response
                .clone()
                .unwrap_or_else(|| ReviewResponse::new(ReviewVerdict::Unavailable));
            record_in(&tx, &request.subject, request.cycle, &invocation.reviewer_id, &response)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Best effort: telemetry never fails a review.
    fn lessons_for(&self, task: &Task) -> Vec<Lesson> {
        let tags = {
            let guard = match self.store.lock_sync() {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "lesson lookup skipped");
                    return Vec::new();
                }
            };
            let mut tags = BTreeSet::new();
            for id in &task.decision_refs {
                match store::decisions::get(guard.conn(), id) {
                    Ok(Some(decision)) => tags.extend(decision.concern_areas),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(decision = %id, error = %e, "lesson lookup skipped a decision"),
                }
            }
            tags
        };
        match self.telemetry.query_lessons(&tags) {
            Ok(lessons) => lessons,
            Err(e) => {
                tracing::warn!(task = %task.id, error = %e, "lesson lookup failed");
                Vec::new()
            }
        }
    }

    /// Eval row for tasks that ended the cycle `done` or `blocked`.
    fn record_eval(&self, task: &Task, aggregate: &AggregateVerdict) {
        let outcome = match task.state {
            TaskState::Done => EvalOutcome::Done,
            TaskState::Blocked => EvalOutcome::Blocked,
            _ => return,
        };
        let findings = self
            .records(&ReviewSubject::Task(task.id))
            .map(|records| records.iter().map(|r| r.findings.len() as u32).sum())
            .unwrap_or(0);
        let mut eval = EvalRecord::new(task.id, outcome);
        eval.cycles_used = aggregate.cycle;
        eval.reviewer_gaps = aggregate.gaps.len() as u32;
        eval.findings_count = findings;
        eval.duration_ms = (Utc::now() - task.created_at).num_milliseconds().max(0) as u64;
        if let Err(e) = self.telemetry.record_eval(eval) {
            tracing::warn!(task = %task.id, error = %e, "failed to record eval");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::AuditChain;
    use crate::errors::CoreError;
    use crate::graph::tests::{graph_with_milestone, m1, spec, t, to_review};
    use crate::review::tests::{Outcome, Scripted};
    use crate::session::Session;
    use foreman_common::{Finding, ReviewerRole, VerificationResult};

    fn controller(graph: TaskGraph, store: StoreHandle) -> ReviewController {
        ReviewController::new(store.clone(), graph, Telemetry::new(store))
    }

    fn pass() -> ReviewResponse {
        ReviewResponse::new(ReviewVerdict::Pass)
    }

    fn block() -> ReviewResponse {
        ReviewResponse::new(ReviewVerdict::Block).with_finding(Finding::new("missing error path"))
    }

    fn stages(store: &StoreHandle) -> Vec<String> {
        AuditChain::new(store.clone())
            .entries(None)
            .unwrap()
            .into_iter()
            .map(|e| e.stage)
            .collect()
    }

    fn started(graph: &TaskGraph, id: TaskId) {
        graph.start(id).unwrap();
        graph
            .record_verification(id, &VerificationResult::passed("ok"))
            .unwrap();
    }

    #[test]
    fn block_and_pass_return_task_for_fix() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        to_review(&graph, t(1));
        let controller = controller(graph, store.clone());
        let subject = ReviewSubject::Task(t(1));

        controller.record_review(&subject, "reviewer-a", block()).unwrap();
        controller.record_review(&subject, "reviewer-b", pass()).unwrap();
        let outcome = controller.adjudicate(t(1)).unwrap();

        assert_eq!(outcome.aggregate.kind, AggregateKind::Block);
        assert_eq!(outcome.task.state, TaskState::InProgress);
        assert_eq!(outcome.task.review_cycle_count, 1);
        assert!(!outcome.escalated);

        let stages = stages(&store);
        let aggregate_at = stages.iter().position(|s| s == stage::REVIEW_AGGREGATE).unwrap();
        let fix_at = stages.iter().rposition(|s| s == stage::TASK_TRANSITION).unwrap();
        assert!(aggregate_at < fix_at);
    }

    #[test]
    fn duplicate_verdict_from_one_reviewer_is_rejected() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        to_review(&graph, t(1));
        let controller = controller(graph, store);
        let subject = ReviewSubject::Task(t(1));
        controller.record_review(&subject, "alice", pass()).unwrap();
        let err = controller.record_review(&subject, "alice", block()).unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::DuplicateReview { cycle: 1, .. })));
    }

    #[test]
    fn pass_completes_and_records_eval() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        to_review(&graph, t(1));
        let controller = controller(graph, store.clone());
        controller
            .record_review(&ReviewSubject::Task(t(1)), "alice", pass())
            .unwrap();
        let outcome = controller.adjudicate(t(1)).unwrap();
        assert_eq!(outcome.aggregate.kind, AggregateKind::Pass);
        assert_eq!(outcome.task.state, TaskState::Done);

        let evals = Telemetry::new(store).evals(Some(t(1))).unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].outcome, EvalOutcome::Done);
        assert_eq!(evals[0].cycles_used, 1);
    }

    #[test]
    fn failing_verification_leaves_the_cycle_open() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        graph.start(t(1)).unwrap();
        graph
            .record_verification(t(1), &VerificationResult::failed("1 failing test"))
            .unwrap();
        graph.submit_for_review(t(1), Evidence::none()).unwrap();
        let controller = controller(graph.clone(), store);
        controller
            .record_review(&ReviewSubject::Task(t(1)), "alice", pass())
            .unwrap();

        let err = controller.adjudicate(t(1)).unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::VerificationRequired { .. })));
        assert!(controller.adjudications(&ReviewSubject::Task(t(1))).unwrap().is_empty());

        graph
            .record_verification(t(1), &VerificationResult::passed("fixed"))
            .unwrap();
        let outcome = controller.adjudicate(t(1)).unwrap();
        assert_eq!(outcome.task.state, TaskState::Done);
        assert_eq!(outcome.aggregate.cycle, 1);
    }

    #[test]
    fn ceiling_blocks_and_escalates() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        started(&graph, t(1));
        let controller = controller(graph, store.clone());
        let subject = ReviewSubject::Task(t(1));

        let mut last = None;
        for _ in 0..3 {
            controller.begin_cycle(t(1), Some("ok")).unwrap();
            controller.record_review(&subject, "alice", block()).unwrap();
            last = Some(controller.adjudicate(t(1)).unwrap());
        }
        let last = last.unwrap();
        assert!(last.escalated);
        assert_eq!(last.task.state, TaskState::Blocked);
        assert_eq!(last.aggregate.cycle, 3);
        assert!(stages(&store).iter().any(|s| s == stage::TASK_ESCALATION));
        assert!(Session::new(store.clone()).awaiting().unwrap().is_some());

        let evals = Telemetry::new(store).evals(Some(t(1))).unwrap();
        assert_eq!(evals[0].outcome, EvalOutcome::Blocked);
        assert_eq!(evals[0].findings_count, 3);
    }

    #[test]
    fn begin_cycle_refuses_fresh_task_while_awaiting_input() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        started(&graph, t(1));
        Session::new(store.clone()).raise("conflict review").unwrap();
        let controller = controller(graph, store);
        let err = controller.begin_cycle(t(1), None).unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::AwaitingInput { .. })));
    }

    #[test]
    fn begin_cycle_surfaces_lessons_for_concern_tags() {
        use crate::decision::{DecisionInput, DecisionStatus, DecisionStore, RuleSet};

        let (graph, store) = graph_with_milestone();
        let decisions = DecisionStore::new(store.clone(), RuleSet::builtin().unwrap());
        let decision = decisions
            .add_decision(
                DecisionInput::new("auth", "Sessions live server-side", ["authentication"])
                    .with_status(DecisionStatus::Confirmed),
            )
            .unwrap();
        graph
            .add_task(&spec(1, &[], "src/a.rs").decision_ref(decision.id))
            .unwrap();
        started(&graph, t(1));
        let telemetry = Telemetry::new(store.clone());
        telemetry
            .record_lesson("Expire sessions on logout", ["authentication"], None)
            .unwrap();

        let controller = ReviewController::new(store, graph, telemetry);
        let cycle = controller.begin_cycle(t(1), None).unwrap();
        assert_eq!(cycle.cycle, 1);
        assert_eq!(cycle.lessons.len(), 1);
        assert_eq!(cycle.task.state, TaskState::UnderReview);
        assert!(cycle.reviewers.is_empty());
    }

    #[test]
    fn start_task_surfaces_lessons_before_work_begins() {
        use crate::decision::{DecisionInput, DecisionStatus, DecisionStore, RuleSet};

        let (graph, store) = graph_with_milestone();
        let decisions = DecisionStore::new(store.clone(), RuleSet::builtin().unwrap());
        let decision = decisions
            .add_decision(
                DecisionInput::new("auth", "Sessions live server-side", ["authentication"])
                    .with_status(DecisionStatus::Confirmed),
            )
            .unwrap();
        graph
            .add_task(&spec(1, &[], "src/a.rs").decision_ref(decision.id))
            .unwrap();
        graph.add_task(&spec(2, &[], "src/b.rs")).unwrap();
        let telemetry = Telemetry::new(store.clone());
        telemetry
            .record_lesson("Expire sessions on logout", ["Authentication"], None)
            .unwrap();
        telemetry.record_lesson("Paginate exports", ["billing"], None).unwrap();

        let controller = ReviewController::new(store, graph, telemetry);
        let started = controller.start_task(t(1)).unwrap();
        assert_eq!(started.task.state, TaskState::InProgress);
        assert_eq!(started.lessons.len(), 1);
        assert_eq!(started.lessons[0].summary, "Expire sessions on logout");

        let err = controller.start_task(t(2)).unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantViolation::AnotherTaskActive { .. })));
    }

    #[tokio::test]
    async fn run_cycle_invokes_selected_reviewers() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/auth/login.rs")).unwrap();
        started(&graph, t(1));
        let style = Arc::new(Scripted::new("style", ReviewerRole::Style, ReviewVerdict::Block));
        let controller = controller(graph, store)
            .with_reviewer(Arc::new(Scripted::new("correct", ReviewerRole::Correctness, ReviewVerdict::Pass)))
            .with_reviewer(Arc::new(Scripted::new("sec", ReviewerRole::Security, ReviewVerdict::Concern)))
            .with_reviewer(style.clone());

        let outcome = controller
            .run_cycle(t(1), Some("ok"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.aggregate.kind, AggregateKind::Concern);
        assert_eq!(outcome.aggregate.records.len(), 2);
        assert_eq!(outcome.task.state, TaskState::Done);
        assert_eq!(style.call_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_reviewer_is_retried_once_then_a_gap() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        started(&graph, t(1));
        let flaky = Arc::new(Scripted::script(
            "flaky",
            ReviewerRole::Correctness,
            vec![Outcome::Fail, Outcome::Fail, Outcome::Verdict(ReviewVerdict::Pass)],
        ));
        let controller = controller(graph, store.clone())
            .with_reviewer(Arc::new(Scripted::new("steady", ReviewerRole::Correctness, ReviewVerdict::Pass)))
            .with_reviewer(flaky.clone());

        let outcome = controller
            .run_cycle(t(1), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(flaky.call_count(), 2);
        assert_eq!(outcome.aggregate.kind, AggregateKind::Concern);
        assert!(outcome.aggregate.degraded);
        assert_eq!(outcome.aggregate.gap_names(), vec!["flaky".to_string()]);
        assert_eq!(outcome.task.state, TaskState::Done);

        let unavailable = stages(&store)
            .iter()
            .filter(|s| *s == stage::REVIEW_UNAVAILABLE)
            .count();
        assert_eq!(unavailable, 2);
    }

    #[tokio::test]
    async fn timed_out_reviewer_is_unavailable_not_block() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        started(&graph, t(1));
        let controller = controller(graph, store)
            .with_policy(
                ReviewPolicy::default()
                    .with_timeout(Duration::from_millis(20))
                    .with_retry(0),
            )
            .with_reviewer(Arc::new(Scripted::new("fast", ReviewerRole::Correctness, ReviewVerdict::Pass)))
            .with_reviewer(Arc::new(
                Scripted::new("slow", ReviewerRole::Correctness, ReviewVerdict::Block)
                    .slow(Duration::from_secs(5)),
            ));

        let outcome = controller
            .run_cycle(t(1), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(outcome.aggregate.kind, AggregateKind::Block);
        assert_eq!(outcome.aggregate.gap_names(), vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn all_reviewers_unavailable_escalates() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        started(&graph, t(1));
        let controller = controller(graph.clone(), store).with_reviewer(Arc::new(Scripted::script(
            "down",
            ReviewerRole::Correctness,
            vec![Outcome::Fail],
        )));

        let outcome = controller
            .run_cycle(t(1), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.escalated);
        assert_eq!(outcome.task.state, TaskState::Blocked);

        graph.unblock(t(1), "reviewer back online").unwrap();
        let cycle = controller.begin_cycle(t(1), None).unwrap();
        assert_eq!(cycle.cycle, 2);
    }

    #[tokio::test]
    async fn cancelled_cycle_records_verdicts_and_blocks() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        started(&graph, t(1));
        let controller = controller(graph, store).with_reviewer(Arc::new(Scripted::new(
            "correct",
            ReviewerRole::Correctness,
            ReviewVerdict::Pass,
        )));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = controller.run_cycle(t(1), None, &cancel).await.unwrap();
        assert!(outcome.escalated);
        assert_eq!(outcome.task.state, TaskState::Blocked);
        assert_eq!(controller.records(&ReviewSubject::Task(t(1))).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_cycle_needs_reviewers() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        started(&graph, t(1));
        let err = controller(graph, store)
            .run_cycle(t(1), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::Invalid(_))));
    }

    #[tokio::test]
    async fn milestone_review_completes_after_all_tasks_done() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        let controller = controller(graph.clone(), store).with_reviewer(Arc::new(Scripted::new(
            "integration",
            ReviewerRole::Milestone,
            ReviewVerdict::Pass,
        )));

        let err = controller
            .run_milestone_review(&m1(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantViolation::MilestoneNotReady { .. })));

        to_review(&graph, t(1));
        graph.complete(t(1), Evidence::none(), None).unwrap();
        let outcome = controller
            .run_milestone_review(&m1(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.verdict, MilestoneVerdict::MilestoneComplete);
        assert_eq!(outcome.milestone.state, MilestoneState::Complete);
    }

    #[test]
    fn manual_milestone_block_needs_fix_then_blocks() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        to_review(&graph, t(1));
        graph.complete(t(1), Evidence::none(), None).unwrap();
        let controller = controller(graph, store.clone());
        let subject = ReviewSubject::Milestone(m1());

        controller.record_review(&subject, "operator", block()).unwrap();
        let first = controller.adjudicate_milestone(&m1()).unwrap();
        assert_eq!(first.verdict, MilestoneVerdict::NeedsFix);

        controller.record_review(&subject, "operator", block()).unwrap();
        let second = controller.adjudicate_milestone(&m1()).unwrap();
        assert_eq!(second.verdict, MilestoneVerdict::Blocked);
        assert_eq!(second.aggregate.cycle, 2);
        assert!(Session::new(store).awaiting().unwrap().is_some());
    }

    #[test]
    fn blocked_milestone_takes_no_further_verdicts_without_override() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        to_review(&graph, t(1));
        graph.complete(t(1), Evidence::none(), None).unwrap();
        let controller = controller(graph.clone(), store.clone());
        let subject = ReviewSubject::Milestone(m1());
        for _ in 0..2 {
            controller.record_review(&subject, "operator", block()).unwrap();
            controller.adjudicate_milestone(&m1()).unwrap();
        }

        let err = controller.record_review(&subject, "operator", pass()).unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantViolation::MilestoneEscalated { .. })));
        let err = controller.adjudicate_milestone(&m1()).unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantViolation::MilestoneEscalated { .. })));
        assert_eq!(controller.records(&subject).unwrap().len(), 2);
        assert!(Session::new(store.clone()).awaiting().unwrap().is_some());

        graph.unblock_milestone(&m1(), "smoke tests repaired").unwrap();
        controller.record_review(&subject, "operator", pass()).unwrap();
        let third = controller.adjudicate_milestone(&m1()).unwrap();
        assert_eq!(third.aggregate.cycle, 3);
        assert_eq!(third.verdict, MilestoneVerdict::MilestoneComplete);
    }

    #[test]
    fn adjudicate_without_records_is_a_contract_error() {
        let (graph, store) = graph_with_milestone();
        graph.add_task(&spec(1, &[], "src/a.rs")).unwrap();
        to_review(&graph, t(1));
        let err = controller(graph, store).adjudicate(t(1)).unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::Invalid(_))));
    }
}
