//! Task and milestone records.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use foreman_common::{DecisionId, MilestoneId, TaskId};
use serde::{Deserialize, Serialize};

/// Lifecycle of a task.
///
/// ```text
/// pending -> in_progress -> under_review -> done
///                 ^              |
///                 '----(fix)-----'
/// in_progress | under_review -> blocked   (escalation)
/// blocked -> in_progress                  (explicit override only)
/// pending | blocked -> cancelled          (operator only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    UnderReview,
    Done,
    Blocked,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::UnderReview => "under_review",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    /// The task currently owns the execution slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress | Self::UnderReview)
    }

    /// Done or cancelled; nothing moves these except rollback.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, UnderReview)
                | (UnderReview, Done)
                | (UnderReview, InProgress)
                | (InProgress, Blocked)
                | (UnderReview, Blocked)
                | (Blocked, InProgress)
                | (Pending, Cancelled)
                | (Blocked, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "under_review" => Ok(Self::UnderReview),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => anyhow::bail!(
                "Invalid task state '{}'. Valid values: pending, in_progress, under_review, done, blocked, cancelled",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    #[default]
    Modify,
}

/// One file a task declares it will touch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawScope")]
pub struct FileScopeEntry {
    pub path: String,
    pub action: FileAction,
}

// Plans may list a bare path, meaning "modify".
#[derive(Deserialize)]
#[serde(untagged)]
enum RawScope {
    Path(String),
    Entry {
        path: String,
        #[serde(default)]
        action: FileAction,
    },
}

impl From<RawScope> for FileScopeEntry {
    fn from(raw: RawScope) -> Self {
        match raw {
            RawScope::Path(path) => Self::modify(path),
            RawScope::Entry { path, action } => Self { path, action },
        }
    }
}

impl FileScopeEntry {
    pub fn create(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Create,
        }
    }

    pub fn modify(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Modify,
        }
    }
}

/// Last self-verification outcome recorded for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub passed: bool,
    pub output_digest: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub milestone_id: MilestoneId,
    pub title: String,
    pub depends_on: BTreeSet<TaskId>,
    pub decision_refs: BTreeSet<DecisionId>,
    pub file_scope: Vec<FileScopeEntry>,
    pub acceptance_criteria: Vec<String>,
    pub state: TaskState,
    pub review_cycle_count: u32,
    /// Extra review cycles granted by explicit overrides.
    pub cycle_allowance: u32,
    pub verification: Option<VerificationRecord>,
    pub override_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn ceiling(&self, max_cycles: u32) -> u32 {
        max_cycles + self.cycle_allowance
    }

    pub fn verification_passed(&self) -> bool {
        self.verification.as_ref().is_some_and(|v| v.passed)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.file_scope.iter().map(|entry| entry.path.as_str())
    }
}

/// Input to `add_task`, also the task shape inside a synthesis plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Next free ordinal when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub milestone: MilestoneId,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub decision_refs: Vec<DecisionId>,
    #[serde(default)]
    pub file_scope: Vec<FileScopeEntry>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl TaskSpec {
    pub fn new(milestone: MilestoneId, title: impl Into<String>) -> Self {
        Self {
            id: None,
            milestone,
            title: title.into(),
            depends_on: Vec::new(),
            decision_refs: Vec::new(),
            file_scope: Vec::new(),
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.depends_on.extend(deps);
        self
    }

    pub fn decision_ref(mut self, id: DecisionId) -> Self {
        self.decision_refs.push(id);
        self
    }

    pub fn scope(mut self, entry: FileScopeEntry) -> Self {
        self.file_scope.push(entry);
        self
    }

    pub fn criterion(mut self, text: impl Into<String>) -> Self {
        self.acceptance_criteria.push(text.into());
        self
    }
}

/// A file claimed by two open tasks in the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeOverlap {
    pub path: String,
    pub action: FileAction,
    pub other_task: TaskId,
}

impl fmt::Display for ScopeOverlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is also declared ({:?}) by open task {}",
            self.path, self.action, self.other_task
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddTaskOutcome {
    pub task: Task,
    pub warnings: Vec<ScopeOverlap>,
}

/// Evidence attached to a transition; its digest becomes the chain entry's
/// input hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Evidence {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            digest: None,
        }
    }

    pub fn digest(digest: impl Into<String>) -> Self {
        Self {
            note: None,
            digest: Some(digest.into()),
        }
    }
}

// ── Milestones ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MilestoneState {
    Open,
    Complete,
}

impl MilestoneState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for MilestoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MilestoneState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "complete" => Ok(Self::Complete),
            _ => anyhow::bail!("Invalid milestone state '{}'", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriterionKind {
    Smoke,
    Integration,
    Functional,
    Regression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationCriterion {
    pub kind: CriterionKind,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub ordinal: u32,
    pub name: String,
    pub goal: String,
    pub integration_criteria: Vec<IntegrationCriterion>,
    pub state: MilestoneState,
    pub review_cycle_count: u32,
    /// Extra review cycles granted by operator overrides.
    #[serde(default)]
    pub cycle_allowance: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Milestone {
    pub fn ceiling(&self, max_cycles: u32) -> u32 {
        max_cycles + self.cycle_allowance
    }

    /// At the ceiling: no further cycle opens until an override.
    pub fn is_escalated(&self, max_cycles: u32) -> bool {
        self.state == MilestoneState::Open && self.review_cycle_count >= self.ceiling(max_cycles)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneSpec {
    pub id: MilestoneId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub integration_criteria: Vec<IntegrationCriterion>,
}

impl MilestoneSpec {
    pub fn new(id: MilestoneId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            goal: String::new(),
            integration_criteria: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_edges() {
        use TaskState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(UnderReview.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Blocked));
        assert!(!Pending.can_transition_to(Done));
        assert!(!InProgress.can_transition_to(Done));
        assert!(!Done.can_transition_to(InProgress));
        assert!(!Cancelled.can_transition_to(Pending));
    }

    #[test]
    fn state_parses_both_separators() {
        assert_eq!("in-progress".parse::<TaskState>().unwrap(), TaskState::InProgress);
        assert_eq!("under_review".parse::<TaskState>().unwrap(), TaskState::UnderReview);
        assert_eq!(TaskState::UnderReview.to_string(), "under_review");
    }

    #[test]
    fn file_scope_accepts_bare_paths() {
        let scope: Vec<FileScopeEntry> =
            serde_json::from_str(r#"["src/a.rs", {"path": "src/b.rs", "action": "create"}]"#).unwrap();
        assert_eq!(scope[0], FileScopeEntry::modify("src/a.rs"));
        assert_eq!(scope[1], FileScopeEntry::create("src/b.rs"));
    }

    #[test]
    fn task_spec_parses_plan_shape() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"id": 2, "milestone": "M1", "title": "Login form", "depends_on": [1],
                "decision_refs": ["AUTH-001"], "file_scope": ["src/login.rs"]}"#,
        )
        .unwrap();
        assert_eq!(spec.id, Some(TaskId::new(2)));
        assert_eq!(spec.depends_on, vec![TaskId::new(1)]);
        assert!(spec.acceptance_criteria.is_empty());
    }
}
