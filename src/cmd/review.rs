use anyhow::Result;
use console::style;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use foreman::config::ForemanConfig;
use foreman::errors::{ContractError, CoreError};
use foreman::graph::TaskState;
use foreman::review::{Adjudication, AggregateVerdict, ReviewRecord};
use foreman::workspace::Access;
use foreman_common::{AggregateKind, Finding, MilestoneId, ReviewResponse, ReviewSubject, ReviewVerdict, TaskId};

use super::task::run_verifier;
use super::{emit, open, parse_arg, parse_id};

/// Verdicts entered with `milestone-review --verdict` are recorded under
/// this reviewer id.
const OPERATOR: &str = "operator";

fn print_aggregate(aggregate: &AggregateVerdict) {
    let kind = style(aggregate.kind.as_str()).bold();
    let kind = match aggregate.kind {
        AggregateKind::Pass => kind.green(),
        AggregateKind::Concern => kind.yellow(),
        AggregateKind::Block => kind.red(),
    };
    println!(
        "{} cycle {}: {}{}",
        aggregate.subject,
        aggregate.cycle,
        kind,
        if aggregate.degraded { " (degraded)" } else { "" }
    );
    for record in &aggregate.records {
        println!("  {:<20} {}", record.reviewer_id, record.verdict);
    }
    for gap in &aggregate.gaps {
        println!("  {} {}", style("gap").yellow(), gap);
    }
    for finding in &aggregate.findings {
        println!("  - {}", finding);
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight reviews");
            token.cancel();
        }
    });
    cancel
}

/// Record one verdict. An in-progress task is submitted for review first.
pub fn cmd_review_record(
    config: &ForemanConfig,
    task: &str,
    reviewer: &str,
    verdict: &str,
    findings: &[String],
) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let verdict: ReviewVerdict = parse_arg(verdict)?;
    let response = findings
        .iter()
        .fold(ReviewResponse::new(verdict), |resp, f| resp.with_finding(Finding::new(f)));

    let ws = open(config, Access::Write)?;
    let controller = ws.review_controller()?;
    let cycle = controller.begin_cycle(id, None)?;
    for lesson in &cycle.lessons {
        if !config.json {
            println!("{} lesson #{}: {}", style("i").cyan(), lesson.id, lesson.summary);
        }
    }
    let record = controller.record_review(&cycle.request.subject, reviewer, response)?;
    emit(config, &record, |r| {
        println!(
            "{} Recorded {} from {} for {} cycle {}",
            style("✓").green(),
            r.verdict,
            r.reviewer_id,
            r.subject,
            r.cycle
        );
    })
}

pub fn cmd_review_adjudicate(config: &ForemanConfig, task: &str) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let ws = open(config, Access::Write)?;
    let outcome = ws.review_controller()?.adjudicate(id)?;
    emit(config, &outcome, |outcome| {
        print_aggregate(&outcome.aggregate);
        println!();
        if outcome.escalated {
            println!(
                "{} {} blocked; session awaits input",
                style("■").red(),
                outcome.task.id
            );
        } else {
            println!("{} is now {}", outcome.task.id, outcome.task.state);
        }
    })
}

/// Verify (when a command is configured), then run one automated cycle.
pub async fn cmd_review_run(config: &ForemanConfig, task: &str) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let ws = open(config, Access::Write)?;
    let controller = ws.review_controller()?;

    let mut verification_output = None;
    if ws.graph.task(id)?.state == TaskState::InProgress && ws.verifier().is_some() {
        let result = run_verifier(&ws, id).await?;
        ws.graph.record_verification(id, &result)?;
        if !result.passed {
            return Err(CoreError::from(ContractError::VerificationRequired { task: id }).into());
        }
        verification_output = Some(result.output);
    }

    let cancel = cancel_on_ctrl_c();
    let outcome = controller
        .run_cycle(id, verification_output.as_deref(), &cancel)
        .await?;
    emit(config, &outcome, |outcome| {
        print_aggregate(&outcome.aggregate);
        println!();
        if outcome.escalated {
            println!(
                "{} {} blocked; session awaits input",
                style("■").red(),
                outcome.task.id
            );
        } else {
            println!("{} is now {}", outcome.task.id, outcome.task.state);
        }
    })
}

pub fn cmd_reviews(config: &ForemanConfig, subject: &str) -> Result<()> {
    let subject: ReviewSubject = parse_arg(subject)?;
    let ws = open(config, Access::Read)?;
    let controller = ws.review_controller()?;

    #[derive(Serialize)]
    struct Reviews {
        subject: ReviewSubject,
        records: Vec<ReviewRecord>,
        adjudications: Vec<Adjudication>,
    }
    let out = Reviews {
        records: controller.records(&subject)?,
        adjudications: controller.adjudications(&subject)?,
        subject,
    };
    emit(config, &out, |out| {
        if out.records.is_empty() {
            println!("No reviews recorded for {}.", out.subject);
            return;
        }
        let last = out.records.iter().map(|r| r.cycle).max().unwrap_or(0);
        for cycle in 1..=last {
            let closed = out.adjudications.iter().find(|a| a.cycle == cycle);
            match closed {
                Some(a) => println!("Cycle {}: {}", cycle, a.kind),
                None => println!("Cycle {}: {}", cycle, style("open").yellow()),
            }
            for r in out.records.iter().filter(|r| r.cycle == cycle) {
                println!("  {:<20} {}", r.reviewer_id, r.verdict);
                for finding in &r.findings {
                    println!("    - {}", finding);
                }
            }
        }
    })
}

/// Milestone integration review, automated or with an operator verdict.
pub async fn cmd_milestone_review(config: &ForemanConfig, milestone: &str, verdict: Option<&str>) -> Result<()> {
    let id: MilestoneId = parse_id(milestone)?;
    let verdict = verdict.map(parse_arg::<ReviewVerdict>).transpose()?;
    let ws = open(config, Access::Write)?;
    let controller = ws.review_controller()?;

    let outcome = match verdict {
        Some(verdict) => {
            controller.ready_milestone(&id)?;
            controller.record_review(&ReviewSubject::Milestone(id.clone()), OPERATOR, ReviewResponse::new(verdict))?;
            controller.adjudicate_milestone(&id)?
        }
        None => {
            let cancel = cancel_on_ctrl_c();
            controller.run_milestone_review(&id, &cancel).await?
        }
    };
    emit(config, &outcome, |outcome| {
        print_aggregate(&outcome.aggregate);
        println!();
        println!("{}: {}", outcome.milestone.id, style(outcome.verdict.as_str()).bold());
    })
}

pub fn cmd_milestone_unblock(config: &ForemanConfig, milestone: &str, reason: &str) -> Result<()> {
    let id: MilestoneId = parse_id(milestone)?;
    let ws = open(config, Access::Write)?;
    let milestone = ws.graph.unblock_milestone(&id, reason)?;
    let ceiling = milestone.ceiling(ws.graph.policy().max_milestone_cycles);
    emit(config, &milestone, |m| {
        println!(
            "{} {} may take {} more review cycle(s)",
            style("▶").cyan(),
            m.id,
            ceiling.saturating_sub(m.review_cycle_count)
        );
    })
}
