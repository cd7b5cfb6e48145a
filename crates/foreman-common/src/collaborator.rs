//! Contracts for the external collaborators the core consumes.
//!
//! Reviewers and verifiers are opaque to the core: it hands them a request,
//! bounds the call with a timeout and records whatever comes back. Any
//! implementation satisfying these traits can be swapped in.

use crate::ids::{DecisionId, MilestoneId, TaskId};
use crate::verdict::ReviewVerdict;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// What a review is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum ReviewSubject {
    Task(TaskId),
    Milestone(MilestoneId),
}

impl fmt::Display for ReviewSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(id) => write!(f, "{}", id),
            Self::Milestone(id) => write!(f, "milestone:{}", id),
        }
    }
}

impl FromStr for ReviewSubject {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("milestone:") {
            Some(rest) => Ok(Self::Milestone(rest.parse()?)),
            None => Ok(Self::Task(s.parse()?)),
        }
    }
}

/// Role a reviewer plays; drives conditional selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerRole {
    /// Always invoked for task reviews.
    Correctness,
    /// Invoked when the task scope touches sensitive paths.
    Security,
    /// Invoked when the task scope touches presentation-layer paths.
    Style,
    /// Invoked for milestone integration reviews.
    Milestone,
}

impl ReviewerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correctness => "correctness",
            Self::Security => "security",
            Self::Style => "style",
            Self::Milestone => "milestone",
        }
    }
}

impl fmt::Display for ReviewerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewerRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "correctness" => Ok(Self::Correctness),
            "security" => Ok(Self::Security),
            "style" => Ok(Self::Style),
            "milestone" => Ok(Self::Milestone),
            _ => anyhow::bail!(
                "Invalid reviewer role '{}'. Valid values: correctness, security, style, milestone",
                s
            ),
        }
    }
}

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Error,
    #[default]
    Warning,
    Info,
}

/// A single observation reported by a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub severity: FindingSeverity,
}

impl Finding {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
            severity: FindingSeverity::default(),
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_severity(mut self, severity: FindingSeverity) -> Self {
        self.severity = severity;
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "[{:?}] {}: {}", self.severity, file, self.message),
            None => write!(f, "[{:?}] {}", self.severity, self.message),
        }
    }
}

/// Input handed to a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub subject: ReviewSubject,
    pub cycle: u32,
    pub changed_files: Vec<String>,
    pub decision_refs: Vec<DecisionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_output: Option<String>,
}

/// A reviewer's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ReviewResponse {
    pub fn new(verdict: ReviewVerdict) -> Self {
        Self {
            verdict,
            findings: Vec::new(),
        }
    }

    pub fn with_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }
}

/// An independent reviewer.
///
/// Returning `Err` (or exceeding the caller's timeout) is recorded as an
/// unavailable outcome, never as a block.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Stable identifier recorded with every verdict.
    fn id(&self) -> &str;

    fn role(&self) -> ReviewerRole;

    async fn review(&self, request: &ReviewRequest) -> anyhow::Result<ReviewResponse>;
}

/// Result of the opaque self-verification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub output: String,
}

impl VerificationResult {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

/// Runs the verification checks for a task. The core only looks at `passed`.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, task_id: TaskId, project_root: &Path) -> anyhow::Result<VerificationResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysPass;

    #[async_trait]
    impl Reviewer for AlwaysPass {
        fn id(&self) -> &str {
            "always-pass"
        }

        fn role(&self) -> ReviewerRole {
            ReviewerRole::Correctness
        }

        async fn review(&self, _request: &ReviewRequest) -> anyhow::Result<ReviewResponse> {
            Ok(ReviewResponse::new(ReviewVerdict::Pass))
        }
    }

    #[tokio::test]
    async fn reviewer_trait_is_object_safe() {
        let reviewer: Box<dyn Reviewer> = Box::new(AlwaysPass);
        let request = ReviewRequest {
            subject: ReviewSubject::Task(TaskId::new(1)),
            cycle: 1,
            changed_files: vec!["src/lib.rs".to_string()],
            decision_refs: Vec::new(),
            verification_output: None,
        };
        let response = reviewer.review(&request).await.unwrap();
        assert_eq!(response.verdict, ReviewVerdict::Pass);
        assert_eq!(reviewer.role(), ReviewerRole::Correctness);
    }

    #[test]
    fn review_response_parses_minimal_json() {
        let response: ReviewResponse = serde_json::from_str(r#"{"verdict": "block"}"#).unwrap();
        assert_eq!(response.verdict, ReviewVerdict::Block);
        assert!(response.findings.is_empty());
    }

    #[test]
    fn subject_round_trips_through_text() {
        let task: ReviewSubject = "T04".parse().unwrap();
        assert_eq!(task, ReviewSubject::Task(TaskId::new(4)));
        let milestone: ReviewSubject = "milestone:M2".parse().unwrap();
        assert_eq!(milestone.to_string(), "milestone:M2");
    }
}
