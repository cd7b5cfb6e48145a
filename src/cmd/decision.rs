use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use std::path::Path;

use foreman::config::ForemanConfig;
use foreman::decision::{
    ConflictResolution, Decision, DecisionInput, DecisionRevision, DecisionStatus, ResolutionAction,
    ResolutionKind,
};
use foreman::errors::{ContractError, CoreError, InvariantViolation};
use foreman::graph::SynthesisPlan;
use foreman::workspace::Access;
use foreman_common::DecisionId;

use super::super::DecisionCommands;
use super::{emit, open, parse_arg, parse_id};

pub fn cmd_decision(config: &ForemanConfig, command: DecisionCommands) -> Result<()> {
    match command {
        DecisionCommands::Add {
            producer,
            text,
            concerns,
            id,
            status,
            amends,
        } => {
            let mut input = DecisionInput::new(producer, text, concerns);
            if let Some(id) = id {
                input = input.with_id(parse_id(&id)?);
            }
            if let Some(status) = status {
                input = input.with_status(parse_arg::<DecisionStatus>(&status)?);
            }
            if let Some(amends) = amends {
                input = input.amending(parse_id(&amends)?);
            }
            let ws = open(config, Access::Write)?;
            let decision = ws.decisions.add_decision(input)?;
            emit(config, &decision, |d| {
                println!("{} Added {} ({})", style("✓").green(), d.id, d.status);
            })
        }
        DecisionCommands::Import { file } => cmd_import(config, &file),
        DecisionCommands::Confirm { id } => {
            let id: DecisionId = parse_id(&id)?;
            let ws = open(config, Access::Write)?;
            let decision = ws.decisions.confirm(&id)?;
            emit(config, &decision, |d| {
                println!("{} {} confirmed", style("✓").green(), d.id);
            })
        }
        DecisionCommands::Amend { id, text, concerns } => {
            let id: DecisionId = parse_id(&id)?;
            let ws = open(config, Access::Write)?;
            let concerns = (!concerns.is_empty()).then_some(concerns.as_slice());
            let decision = ws.decisions.amend(&id, &text, concerns)?;
            emit(config, &decision, |d| {
                println!("{} {} now at revision {}", style("✓").green(), d.id, d.revision);
            })
        }
        DecisionCommands::List => {
            let ws = open(config, Access::Read)?;
            let decisions = ws.decisions.list()?;
            emit(config, &decisions, |decisions| {
                if decisions.is_empty() {
                    println!("No decisions recorded.");
                    return;
                }
                for d in decisions {
                    print_decision_line(d);
                }
            })
        }
        DecisionCommands::Show { id } => {
            let id: DecisionId = parse_id(&id)?;
            let ws = open(config, Access::Read)?;
            #[derive(Serialize)]
            struct Shown {
                decision: Decision,
                history: Vec<DecisionRevision>,
            }
            let shown = Shown {
                decision: ws.decisions.get(&id)?,
                history: ws.decisions.history(&id)?,
            };
            emit(config, &shown, |shown| {
                let d = &shown.decision;
                println!();
                println!("{}  {}", style(d.id.as_str()).bold(), d.status);
                println!("  producer: {}", d.producer);
                println!("  concerns: {}", join(d.concern_areas.iter()));
                if let Some(amends) = &d.amends {
                    println!("  amends:   {}", amends);
                }
                println!();
                println!("{}", textwrap::indent(&textwrap::fill(&d.text, 76), "  "));
                if shown.history.len() > 1 {
                    println!();
                    println!("History:");
                    for rev in &shown.history {
                        println!(
                            "  r{}  {}  {}",
                            rev.revision,
                            rev.created_at.format("%Y-%m-%d %H:%M"),
                            rev.status
                        );
                    }
                }
                println!();
            })
        }
    }
}

fn cmd_import(config: &ForemanConfig, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read decision file: {}", file.display()))?;
    let inputs: Vec<DecisionInput> = serde_json::from_str(&raw).map_err(|e| {
        CoreError::from(ContractError::Invalid(format!(
            "{} is not a JSON array of decision records: {}",
            file.display(),
            e
        )))
    })?;
    let ws = open(config, Access::Write)?;
    let imported = ws.decisions.import(&inputs)?;
    emit(config, &imported, |imported| {
        println!("{} Imported {} decision(s)", style("✓").green(), imported.len());
        for d in imported {
            print_decision_line(d);
        }
    })
}

fn print_decision_line(d: &Decision) {
    let status = match d.status {
        DecisionStatus::Confirmed => style(d.status.as_str()).green(),
        DecisionStatus::Superseded => style(d.status.as_str()).dim(),
        _ => style(d.status.as_str()).yellow(),
    };
    println!(
        "  {:<10} {:<11} r{}  [{}]  {}",
        d.id.as_str(),
        status,
        d.revision,
        join(d.concern_areas.iter()),
        truncate(&d.text, 60)
    );
}

/// Print the concern index and conflicts; unresolved conflicts fail the
/// command.
pub fn cmd_deconflict(config: &ForemanConfig) -> Result<()> {
    let ws = open(config, Access::Read)?;
    let report = ws.decisions.report()?;
    emit(config, &report, |report| {
        println!();
        println!("Concern index:");
        if report.index.is_empty() {
            println!("  (empty)");
        }
        for (concern, ids) in &report.index {
            println!("  {:<20} {}", concern, join(ids.iter().map(|id| id.as_str())));
        }
        println!();
        if report.conflicts.is_empty() {
            println!("{} No conflicts detected", style("✓").green());
            return;
        }
        println!("Conflicts:");
        for conflict in &report.conflicts {
            let open = report.unresolved.iter().any(|c| c.id == conflict.id);
            let marker = if open {
                style("✗").red()
            } else {
                style("✓").green()
            };
            println!("  {} {}", marker, conflict);
        }
        println!();
    })?;

    if !report.is_clear() {
        return Err(CoreError::from(InvariantViolation::UnresolvedConflicts {
            conflicts: report.unresolved,
        })
        .into());
    }
    Ok(())
}

pub fn cmd_conflict_resolve(
    config: &ForemanConfig,
    id: &str,
    resolution: &str,
    decision: Option<&str>,
    text: Option<&str>,
    rationale: &str,
) -> Result<()> {
    let kind: ResolutionKind = parse_arg(resolution)?;
    let rationale = rationale.to_string();
    let target = || -> Result<DecisionId> {
        let raw = decision.ok_or_else(|| {
            CoreError::from(ContractError::Invalid(format!(
                "--decision is required to resolve as {}",
                kind
            )))
        })?;
        parse_id(raw)
    };
    let action = match kind {
        ResolutionKind::Accepted => ResolutionAction::Accept { rationale },
        ResolutionKind::Amended => ResolutionAction::Amend {
            decision: target()?,
            text: text
                .ok_or_else(|| {
                    CoreError::from(ContractError::Invalid(
                        "--text is required to resolve as amended".to_string(),
                    ))
                })?
                .to_string(),
            rationale,
        },
        ResolutionKind::Superseded => ResolutionAction::Supersede {
            decision: target()?,
            rationale,
        },
    };

    let ws = open(config, Access::Write)?;
    let resolved = ws.decisions.resolve_conflict(id.trim(), action)?;
    emit(config, &resolved, print_resolution)
}

fn print_resolution(r: &ConflictResolution) {
    println!(
        "{} Conflict {} resolved as {}{}",
        style("✓").green(),
        r.conflict_id,
        r.resolution,
        r.decision
            .as_ref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default()
    );
}

pub fn cmd_generate(config: &ForemanConfig, plan: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(plan)
        .with_context(|| format!("Failed to read plan: {}", plan.display()))?;
    let plan = SynthesisPlan::from_json(&raw)?;
    let ws = open(config, Access::Write)?;
    let outcome = ws.graph.generate(&ws.decisions, &plan)?;
    emit(config, &outcome, |outcome| {
        println!(
            "{} Generated {} milestone(s) and {} task(s)",
            style("✓").green(),
            outcome.milestones.len(),
            outcome.tasks.len()
        );
        for task in &outcome.tasks {
            println!("  {:<5} {:<5} {}", task.id, task.milestone_id, task.title);
        }
        for warning in &outcome.warnings {
            println!("{} {}", style("!").yellow(), warning);
        }
        if !outcome.coverage.uncovered_decisions.is_empty() {
            println!(
                "{} Decisions no task references: {}",
                style("!").yellow(),
                join(outcome.coverage.uncovered_decisions.iter().map(|d| d.as_str()))
            );
        }
        if !outcome.coverage.uncovered_concerns.is_empty() {
            println!(
                "{} Concern areas with no covering task: {}",
                style("!").yellow(),
                join(outcome.coverage.uncovered_concerns.iter())
            );
        }
    })
}

fn join<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
