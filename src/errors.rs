//! Typed error hierarchy for the Foreman core.
//!
//! The taxonomy follows how callers must react:
//! - `ContractError`: malformed input; rejected synchronously, nothing applied
//! - `InvariantViolation`: the operation would break a structural rule
//! - `CollaboratorUnavailable`: a reviewer or verifier could not be reached
//! - `IntegrityFailure`: stored history does not verify; never auto-repaired
//!
//! `CoreError` wraps all of them plus storage faults and knows which process
//! exit code each class maps to.

use foreman_common::{DecisionId, FindingId, IdError, MilestoneId, TaskId};
use std::fmt;
use thiserror::Error;

use crate::decision::Conflict;
use crate::graph::TaskState;
use crate::store::StoreError;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Malformed input to a core operation.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error(transparent)]
    InvalidId(#[from] IdError),

    #[error("Decision text must not be empty")]
    EmptyDecisionText,

    #[error("Decision {id} must declare at least one concern area")]
    NoConcernAreas { id: String },

    #[error("Producer '{producer}' already uses tag {expected}; got id {id}")]
    ProducerTagMismatch {
        producer: String,
        expected: String,
        id: DecisionId,
    },

    #[error("Decision tag {tag} already belongs to producer '{owner}'")]
    TagOwnedByOtherProducer { tag: String, owner: String },

    #[error("Decision id {id} is not above the last ordinal {last} for tag {tag}")]
    NonMonotonicDecisionId { id: DecisionId, tag: String, last: u32 },

    #[error("Decision {0} does not exist")]
    UnknownDecision(DecisionId),

    #[error("Decision {id} is {status} and cannot be used here")]
    DecisionNotActive { id: DecisionId, status: String },

    #[error("Conflict {0} does not exist in the current decision set")]
    UnknownConflict(String),

    #[error("Conflict {id} is a direct contradiction and cannot be accepted; amend or supersede one side")]
    ContradictionNeedsChange { id: String },

    #[error("Resolution names decision {decision}, which is not part of conflict {conflict}")]
    ResolutionOutsideConflict { conflict: String, decision: DecisionId },

    #[error("Task {0} does not exist")]
    UnknownTask(TaskId),

    #[error("Task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Milestone {0} does not exist")]
    UnknownMilestone(MilestoneId),

    #[error("Milestone {0} already exists")]
    DuplicateMilestone(MilestoneId),

    #[error("Milestone {0} is complete and accepts no new tasks")]
    MilestoneClosed(MilestoneId),

    #[error("Task {0} declares an empty file scope")]
    EmptyFileScope(TaskId),

    #[error("Finding {0} does not exist")]
    UnknownFinding(FindingId),

    #[error("Reviewer '{reviewer}' already recorded a verdict for {subject} cycle {cycle}")]
    DuplicateReview {
        subject: String,
        reviewer: String,
        cycle: u32,
    },

    #[error("Task {task} has no passing verification result; run verification first")]
    VerificationRequired { task: TaskId },

    #[error("Task {task} is {state}; expected {expected}")]
    UnexpectedState {
        task: TaskId,
        state: TaskState,
        expected: &'static str,
    },

    #[error("Checkpoint '{0}' does not exist")]
    UnknownCheckpoint(String),

    #[error("Checkpoint '{0}' already exists")]
    DuplicateCheckpoint(String),

    #[error("Session is awaiting operator input: {reason}")]
    AwaitingInput { reason: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("{0}")]
    Invalid(String),
}

/// Operations that would break acyclicity, state-machine ordering or linkage.
#[derive(Debug, Error)]
pub enum InvariantViolation {
    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Task {task} depends on {dependency}, which is not an earlier task")]
    ForwardDependency { task: TaskId, dependency: TaskId },

    #[error("Illegal transition for task {task}: {from} -> {to}")]
    IllegalTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task {task} cannot start: dependencies not done: {}", join(.pending))]
    DependenciesIncomplete { task: TaskId, pending: Vec<TaskId> },

    #[error("Task {active} is already active; finish or block it before starting {requested}")]
    AnotherTaskActive { active: TaskId, requested: TaskId },

    #[error("Task {task} used {cycles} review cycles (ceiling {ceiling}); completing it needs an explicit override")]
    ReviewCeilingExceeded { task: TaskId, cycles: u32, ceiling: u32 },

    #[error("Milestone {milestone} is not ready for review: tasks not done: {}", join(.pending))]
    MilestoneNotReady {
        milestone: MilestoneId,
        pending: Vec<TaskId>,
    },

    #[error("Milestone {0} is already complete")]
    MilestoneAlreadyComplete(MilestoneId),

    #[error("Milestone {milestone} used {cycles} review cycles (ceiling {ceiling}) and is escalated")]
    MilestoneEscalated {
        milestone: MilestoneId,
        cycles: u32,
        ceiling: u32,
    },

    #[error("Finding {finding} can only be resolved once milestone {milestone} is complete")]
    FindingNotResolvable {
        finding: FindingId,
        milestone: MilestoneId,
    },

    #[error("Finding {0} is already resolved")]
    FindingAlreadyResolved(FindingId),

    #[error("Decision {id} is superseded and immutable")]
    DecisionSuperseded { id: DecisionId },

    #[error("Decision {id} is already confirmed")]
    DecisionAlreadyConfirmed { id: DecisionId },

    #[error("{} unresolved decision conflict(s) block task generation", .conflicts.len())]
    UnresolvedConflicts { conflicts: Vec<Conflict> },
}

/// A collaborator call failed or timed out after the retry budget.
#[derive(Debug, Error)]
pub enum CollaboratorUnavailable {
    #[error("Reviewer '{reviewer}' unavailable: {reason}")]
    Reviewer { reviewer: String, reason: String },

    #[error("Verification for task {task} unavailable: {reason}")]
    Verifier { task: TaskId, reason: String },
}

/// Stored history failed verification.
#[derive(Debug, Error)]
pub enum IntegrityFailure {
    #[error("Audit chain verification failed at sequence(s) {}", join(.broken))]
    ChainBroken { broken: Vec<u64> },

    #[error("Task graph invariant violated: {0}")]
    GraphInvariant(String),
}

/// Classification used for exit codes and payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Contract,
    Invariant,
    Collaborator,
    Integrity,
    Storage,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Contract => "contract",
            Self::Invariant => "invariant",
            Self::Collaborator => "collaborator",
            Self::Integrity => "integrity",
            Self::Storage => "storage",
        };
        f.write_str(s)
    }
}

/// Top-level error for every core operation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorUnavailable),

    #[error(transparent)]
    Integrity(#[from] IntegrityFailure),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<IdError> for CoreError {
    fn from(err: IdError) -> Self {
        Self::Contract(ContractError::InvalidId(err))
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StoreError::Sqlite(err))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(StoreError::Json(err))
    }
}

impl CoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Contract(_) => ErrorClass::Contract,
            Self::Invariant(_) => ErrorClass::Invariant,
            Self::Collaborator(_) => ErrorClass::Collaborator,
            Self::Integrity(_) => ErrorClass::Integrity,
            Self::Storage(_) => ErrorClass::Storage,
        }
    }

    /// Process exit code: integrity failures are distinct from everything else.
    pub fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::Integrity => 2,
            _ => 1,
        }
    }

    /// A short instruction telling the caller how to retry correctly.
    pub fn fix_hint(&self) -> String {
        match self {
            Self::Contract(ContractError::UnknownDependency { dependency, .. }) => {
                format!("Add task {} first or drop it from depends_on", dependency)
            }
            Self::Contract(ContractError::VerificationRequired { task }) => {
                format!("Run `foreman verify {}` until it passes", task)
            }
            Self::Contract(ContractError::AwaitingInput { .. }) => {
                "Resolve the escalation, then run `foreman resume --note <text>`".to_string()
            }
            Self::Contract(ContractError::ContradictionNeedsChange { .. }) => {
                "Amend or supersede one of the decisions, then resolve with --as amended|superseded"
                    .to_string()
            }
            Self::Contract(_) => "Correct the input and retry; nothing was applied".to_string(),
            Self::Invariant(InvariantViolation::CyclicDependency { .. })
            | Self::Invariant(InvariantViolation::ForwardDependency { .. }) => {
                "Tasks may only depend on earlier tasks; reorder or split the plan".to_string()
            }
            Self::Invariant(InvariantViolation::DependenciesIncomplete { .. }) => {
                "Use `foreman next` to pick an eligible task".to_string()
            }
            Self::Invariant(InvariantViolation::ReviewCeilingExceeded { task, .. }) => format!(
                "Escalate to a human; `foreman task-done {} --override` records an explicit override",
                task
            ),
            Self::Invariant(InvariantViolation::MilestoneEscalated { milestone, .. }) => format!(
                "Fix the integration issues, then `foreman milestone-unblock {} --reason <text>`",
                milestone
            ),
            Self::Invariant(InvariantViolation::UnresolvedConflicts { .. }) => {
                "Run `foreman deconflict` and resolve every conflict before generating tasks"
                    .to_string()
            }
            Self::Invariant(_) => "The operation had no effect; check state with `foreman status`".to_string(),
            Self::Collaborator(_) => "Check the collaborator command and timeout in foreman.toml".to_string(),
            Self::Integrity(_) => {
                "Do not continue: inspect the store with `foreman log` and restore from a trusted copy"
                    .to_string()
            }
            Self::Storage(_) => "Check that .foreman/foreman.db is readable and not locked".to_string(),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_dependency_names_the_cycle() {
        let err = InvariantViolation::CyclicDependency {
            cycle: vec![TaskId::new(3), TaskId::new(5), TaskId::new(3)],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: T03 -> T05 -> T03");
    }

    #[test]
    fn integrity_failures_exit_with_two() {
        let err: CoreError = IntegrityFailure::ChainBroken { broken: vec![4] }.into();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.class(), ErrorClass::Integrity);
        assert!(err.to_string().contains('4'));
    }

    #[test]
    fn contract_and_invariant_errors_exit_with_one() {
        let contract: CoreError = ContractError::UnknownTask(TaskId::new(9)).into();
        let invariant: CoreError = InvariantViolation::ForwardDependency {
            task: TaskId::new(3),
            dependency: TaskId::new(5),
        }
        .into();
        assert_eq!(contract.exit_code(), 1);
        assert_eq!(invariant.exit_code(), 1);
        assert!(invariant.to_string().contains("T05"));
    }

    #[test]
    fn every_error_has_a_fix_hint() {
        let errors: Vec<CoreError> = vec![
            ContractError::EmptyDecisionText.into(),
            InvariantViolation::MilestoneAlreadyComplete("M1".parse().unwrap()).into(),
            CollaboratorUnavailable::Reviewer {
                reviewer: "sec".into(),
                reason: "timeout".into(),
            }
            .into(),
            IntegrityFailure::GraphInvariant("x".into()).into(),
        ];
        for err in errors {
            assert!(!err.fix_hint().is_empty());
        }
    }

    #[test]
    fn id_errors_are_contract_errors() {
        let err: CoreError = "bogus".parse::<TaskId>().unwrap_err().into();
        assert_eq!(err.class(), ErrorClass::Contract);
    }
}
