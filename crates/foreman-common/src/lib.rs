//! Shared domain vocabulary for the Foreman orchestrator.
//!
//! This crate holds the types that cross the boundary between the core and
//! its collaborators:
//!
//! - [`ids`]: identifiers for tasks, milestones, decisions and findings
//! - [`verdict`]: reviewer verdicts and aggregate outcomes
//! - [`collaborator`]: the [`Reviewer`] and [`Verifier`] contracts
//!
//! It deliberately has no storage or CLI dependency so reviewer and verifier
//! implementations can depend on it alone.

pub mod collaborator;
pub mod ids;
pub mod verdict;

pub use collaborator::{
    Finding, FindingSeverity, ReviewRequest, ReviewResponse, ReviewSubject, Reviewer,
    ReviewerRole, VerificationResult, Verifier,
};
pub use ids::{DecisionId, FindingId, IdError, MilestoneId, TaskId};
pub use verdict::{AggregateKind, MilestoneVerdict, ReviewVerdict};
