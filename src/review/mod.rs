//! Review cycles for tasks and milestones.
//!
//! A cycle collects one immutable [`ReviewRecord`] per reviewer, folds them
//! into an [`AggregateVerdict`] and applies it to the task graph. The
//! aggregate is written to the audit chain before the graph is touched.
//!
//! ## Components
//!
//! - [`selection`]: which reviewer roles a cycle needs
//! - [`aggregate`]: the block > concern > pass fold and gap degradation
//! - [`controller`]: the manual and automated cycle API
//! - [`command`]: reviewer and verifier collaborators backed by external commands

pub mod aggregate;
pub mod command;
pub mod controller;
pub mod selection;

use std::time::Duration;

use chrono::{DateTime, Utc};
use foreman_common::{AggregateKind, Finding, ReviewSubject, ReviewVerdict, ReviewerRole};
use serde::{Deserialize, Serialize};

pub use aggregate::aggregate;
pub use command::{CommandReviewer, CommandVerifier};
pub use controller::{MilestoneReviewOutcome, ReviewController, ReviewCycle, StartedTask, TaskReviewOutcome};
pub use selection::Routing;

/// Default per-call reviewer timeout.
pub const DEFAULT_REVIEWER_TIMEOUT_SECS: u64 = 300;

/// One reviewer's verdict for one cycle. Never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub subject: ReviewSubject,
    pub cycle: u32,
    pub reviewer_id: String,
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Chain entry written for this record.
    pub chain_seq: u64,
    pub created_at: DateTime<Utc>,
}

/// A reviewer whose input the aggregate is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewGap {
    pub reviewer: String,
    pub reason: String,
}

impl ReviewGap {
    pub fn missing_role(role: ReviewerRole) -> Self {
        Self {
            reviewer: format!("role:{}", role),
            reason: format!("no {} reviewer configured", role),
        }
    }

    pub fn missing(reviewer: impl Into<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            reason: "no verdict recorded".to_string(),
        }
    }

    pub fn unavailable(reviewer: impl Into<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            reason: "unavailable after retry".to_string(),
        }
    }
}

impl std::fmt::Display for ReviewGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reviewer, self.reason)
    }
}

/// Outcome of one review cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateVerdict {
    pub subject: ReviewSubject,
    pub cycle: u32,
    pub kind: AggregateKind,
    /// `kind` was lowered from PASS to CONCERN because of gaps.
    pub degraded: bool,
    pub records: Vec<ReviewRecord>,
    pub gaps: Vec<ReviewGap>,
    pub findings: Vec<Finding>,
}

impl AggregateVerdict {
    /// At least one reviewer returned a real verdict.
    pub fn has_verdicts(&self) -> bool {
        self.records.iter().any(|r| r.verdict.is_available())
    }

    pub fn gap_names(&self) -> Vec<String> {
        self.gaps.iter().map(|g| g.reviewer.clone()).collect()
    }
}

/// A closed cycle. Its number is never reused for the same subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjudication {
    pub subject: ReviewSubject,
    pub cycle: u32,
    pub kind: AggregateKind,
    pub degraded: bool,
    pub gaps: Vec<ReviewGap>,
    pub chain_seq: u64,
    pub created_at: DateTime<Utc>,
}

/// How reviewers are invoked.
#[derive(Debug, Clone)]
pub struct ReviewPolicy {
    pub reviewer_timeout: Duration,
    /// Extra attempts after an unavailable outcome. Never more than one.
    pub retry_unavailable: u32,
    pub parallel: bool,
    pub routing: Routing,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            reviewer_timeout: Duration::from_secs(DEFAULT_REVIEWER_TIMEOUT_SECS),
            retry_unavailable: 1,
            parallel: true,
            routing: Routing::default(),
        }
    }
}

impl ReviewPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.reviewer_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retries: u32) -> Self {
        self.retry_unavailable = retries.min(1);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }
}
