//! Outbound notifications.
//!
//! The core notifies subscribers after a state change has been committed but
//! never depends on them: a subscriber that errors (or panics) is logged and
//! skipped. Side-effect integrations such as file-change hooks attach here.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use foreman_common::{AggregateKind, MilestoneId, MilestoneVerdict, ReviewSubject, TaskId};
use serde::Serialize;

use crate::graph::TaskState;

/// Lifecycle events published by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    TaskAdded {
        task: TaskId,
        milestone: MilestoneId,
    },
    TaskTransitioned {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },
    TaskEscalated {
        task: TaskId,
        reason: String,
    },
    ReviewAggregated {
        subject: ReviewSubject,
        cycle: u32,
        verdict: AggregateKind,
        gaps: Vec<String>,
    },
    MilestoneReviewed {
        milestone: MilestoneId,
        verdict: MilestoneVerdict,
    },
    AwaitingInput {
        reason: String,
    },
    RolledBack {
        label: String,
    },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskAdded { .. } => "task_added",
            Self::TaskTransitioned { .. } => "task_transitioned",
            Self::TaskEscalated { .. } => "task_escalated",
            Self::ReviewAggregated { .. } => "review_aggregated",
            Self::MilestoneReviewed { .. } => "milestone_reviewed",
            Self::AwaitingInput { .. } => "awaiting_input",
            Self::RolledBack { .. } => "rolled_back",
        }
    }
}

pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;

    fn notify(&self, event: &CoreEvent) -> anyhow::Result<()>;
}

/// Fan-out to every registered subscriber, in registration order.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn emit(&self, event: &CoreEvent) {
        for subscriber in &self.subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber.notify(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    subscriber = subscriber.name(),
                    event = event.name(),
                    error = %e,
                    "event subscriber failed"
                ),
                Err(_) => tracing::warn!(
                    subscriber = subscriber.name(),
                    event = event.name(),
                    "event subscriber panicked"
                ),
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Logs every event at debug level.
pub struct TracingSubscriber;

impl EventSubscriber for TracingSubscriber {
    fn name(&self) -> &str {
        "tracing"
    }

    fn notify(&self, event: &CoreEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        tracing::debug!(event = event.name(), %payload, "core event");
        Ok(())
    }
}
