use anyhow::Result;
use console::style;
use serde::Serialize;

use foreman::config::ForemanConfig;
use foreman::errors::{CollaboratorUnavailable, ContractError, CoreError};
use foreman::graph::{
    DeferredFinding, Evidence, FileScopeEntry, FindingStatus, Milestone, MilestoneState, Task, TaskSpec,
    TaskState,
};
use foreman::workspace::{Access, Workspace};
use foreman_common::{FindingId, MilestoneId, TaskId, VerificationResult, Verifier};

use super::super::FindingCommands;
use super::{emit, open, parse_arg, parse_id};

fn state_style(state: TaskState) -> console::StyledObject<&'static str> {
    let s = style(state.as_str());
    match state {
        TaskState::Done => s.green(),
        TaskState::InProgress | TaskState::UnderReview => s.cyan(),
        TaskState::Blocked => s.red(),
        TaskState::Cancelled => s.dim(),
        TaskState::Pending => s,
    }
}

fn print_task_line(task: &Task) {
    println!(
        "  {:<5} {:<5} {:<14} {}",
        task.id.to_string(),
        task.milestone_id.as_str(),
        state_style(task.state),
        task.title
    );
}

fn print_task(task: &Task, max_cycles: u32) {
    println!();
    println!("{}  {}", style(task.id.to_string()).bold(), task.title);
    println!("  milestone:     {}", task.milestone_id);
    println!("  state:         {}", state_style(task.state));
    println!(
        "  review cycles: {}/{}",
        task.review_cycle_count,
        task.ceiling(max_cycles)
    );
    if !task.depends_on.is_empty() {
        let deps: Vec<String> = task.depends_on.iter().map(|d| d.to_string()).collect();
        println!("  depends on:    {}", deps.join(", "));
    }
    if !task.decision_refs.is_empty() {
        let refs: Vec<&str> = task.decision_refs.iter().map(|d| d.as_str()).collect();
        println!("  decisions:     {}", refs.join(", "));
    }
    if let Some(v) = &task.verification {
        println!(
            "  verification:  {} ({})",
            if v.passed {
                style("pass").green()
            } else {
                style("fail").red()
            },
            v.recorded_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if let Some(reason) = &task.override_reason {
        println!("  override:      {}", reason);
    }
    if !task.file_scope.is_empty() {
        println!("  files:");
        for entry in &task.file_scope {
            println!("    {:?} {}", entry.action, entry.path);
        }
    }
    if !task.acceptance_criteria.is_empty() {
        println!("  acceptance:");
        for criterion in &task.acceptance_criteria {
            println!("    - {}", criterion);
        }
    }
    println!();
}

pub fn cmd_next(config: &ForemanConfig) -> Result<()> {
    let ws = open(config, Access::Read)?;
    let next = ws.graph.next_eligible_task()?;
    emit(config, &next, |next| match next {
        Some(task) => print_task(task, ws.graph.policy().max_task_cycles),
        None => println!("No eligible task."),
    })
}

pub fn cmd_task_start(config: &ForemanConfig, task: &str) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let ws = open(config, Access::Write)?;
    let started = ws.review_controller()?.start_task(id)?;
    emit(config, &started, |s| {
        println!("{} {} in progress: {}", style("▶").cyan(), s.task.id, s.task.title);
        for lesson in &s.lessons {
            println!("  {} lesson #{}: {}", style("i").cyan(), lesson.id, lesson.summary);
        }
    })
}

pub fn cmd_task_done(config: &ForemanConfig, task: &str, override_reason: Option<&str>) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let ws = open(config, Access::Write)?;
    let evidence = override_reason.map(Evidence::note).unwrap_or_default();
    let task = ws.graph.complete(id, evidence, override_reason)?;
    emit(config, &task, |t| {
        println!("{} {} done", style("✓").green(), t.id);
    })
}

pub fn cmd_task_block(config: &ForemanConfig, task: &str, reason: &str) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let ws = open(config, Access::Write)?;
    let task = ws.graph.escalate(id, reason)?;
    emit(config, &task, |t| {
        println!("{} {} blocked; session awaits input", style("■").red(), t.id);
    })
}

pub fn cmd_task_unblock(config: &ForemanConfig, task: &str, reason: &str) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let ws = open(config, Access::Write)?;
    let task = ws.graph.unblock(id, reason)?;
    emit(config, &task, |t| {
        println!(
            "{} {} back in progress (cycle ceiling now {})",
            style("▶").cyan(),
            t.id,
            t.ceiling(ws.graph.policy().max_task_cycles)
        );
    })
}

pub fn cmd_task_cancel(config: &ForemanConfig, task: &str, reason: &str) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let ws = open(config, Access::Write)?;
    let task = ws.graph.cancel(id, reason)?;
    emit(config, &task, |t| {
        println!("{} {} cancelled", style("-").dim(), t.id);
    })
}

pub fn cmd_task_show(config: &ForemanConfig, task: &str) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let ws = open(config, Access::Read)?;
    let task = ws.graph.task(id)?;
    emit(config, &task, |t| print_task(t, ws.graph.policy().max_task_cycles))
}

pub fn cmd_tasks(config: &ForemanConfig, state: Option<&str>) -> Result<()> {
    let filter = state.map(parse_arg::<TaskState>).transpose()?;
    let ws = open(config, Access::Read)?;
    let tasks: Vec<Task> = ws
        .graph
        .tasks()?
        .into_iter()
        .filter(|t| filter.is_none_or(|s| t.state == s))
        .collect();
    emit(config, &tasks, |tasks| {
        if tasks.is_empty() {
            println!("No tasks.");
            return;
        }
        for task in tasks {
            print_task_line(task);
        }
    })
}

/// Run the configured verifier, or record an operator-supplied result.
pub async fn cmd_verify(
    config: &ForemanConfig,
    task: &str,
    result: Option<&str>,
    output: Option<&str>,
) -> Result<()> {
    let id: TaskId = parse_id(task)?;
    let ws = open(config, Access::Write)?;
    let result = match result {
        Some(raw) => manual_result(raw, output.unwrap_or_default())?,
        None => run_verifier(&ws, id).await?,
    };
    let task = ws.graph.record_verification(id, &result)?;

    #[derive(Serialize)]
    struct Verified<'a> {
        task: &'a Task,
        passed: bool,
        output: &'a str,
    }
    let out = Verified {
        task: &task,
        passed: result.passed,
        output: &result.output,
    };
    emit(config, &out, |out| {
        if out.passed {
            println!("{} {} verification passed", style("✓").green(), out.task.id);
        } else {
            println!("{} {} verification failed", style("✗").red(), out.task.id);
        }
        let tail: Vec<&str> = out.output.lines().rev().take(20).collect();
        for line in tail.into_iter().rev() {
            println!("  {}", style(line).dim());
        }
    })
}

fn manual_result(raw: &str, output: &str) -> Result<VerificationResult> {
    match raw.trim().to_lowercase().as_str() {
        "pass" | "passed" => Ok(VerificationResult::passed(output)),
        "fail" | "failed" => Ok(VerificationResult::failed(output)),
        _ => Err(CoreError::from(ContractError::Invalid(format!(
            "Invalid verification result '{}'. Valid values: pass, fail",
            raw
        )))
        .into()),
    }
}

pub(crate) async fn run_verifier(ws: &Workspace, id: TaskId) -> Result<VerificationResult> {
    let verifier = ws.verifier().ok_or_else(|| {
        CoreError::from(ContractError::Invalid(
            "No [verification] command configured; pass --result pass|fail to record one".to_string(),
        ))
    })?;
    tracing::info!(task = %id, "running verification");
    verifier
        .verify(id, &ws.config.project_dir)
        .await
        .map_err(|e| {
            CoreError::from(CollaboratorUnavailable::Verifier {
                task: id,
                reason: format!("{:#}", e),
            })
            .into()
        })
}

pub fn cmd_milestones(config: &ForemanConfig) -> Result<()> {
    let ws = open(config, Access::Read)?;

    #[derive(Serialize)]
    struct MilestoneView {
        #[serde(flatten)]
        milestone: Milestone,
        tasks: usize,
        pending: Vec<TaskId>,
    }
    let mut views = Vec::new();
    for milestone in ws.graph.milestones()? {
        views.push(MilestoneView {
            tasks: ws.graph.milestone_tasks(&milestone.id)?.len(),
            pending: ws.graph.milestone_pending(&milestone.id)?,
            milestone,
        });
    }
    emit(config, &views, |views| {
        if views.is_empty() {
            println!("No milestones.");
            return;
        }
        for v in views {
            let m = &v.milestone;
            let state = match m.state {
                MilestoneState::Complete => style(m.state.as_str()).green(),
                _ => style(m.state.as_str()).yellow(),
            };
            let readiness = if m.state == MilestoneState::Complete {
                String::new()
            } else if v.pending.is_empty() {
                "ready for review".to_string()
            } else {
                format!("{} task(s) outstanding", v.pending.len())
            };
            println!(
                "  {:<6} {:<9} {:<24} {} task(s)  {}",
                m.id.as_str(),
                state,
                m.name,
                v.tasks,
                readiness
            );
        }
    })
}

pub fn cmd_finding(config: &ForemanConfig, command: FindingCommands) -> Result<()> {
    match command {
        FindingCommands::Add {
            task,
            category,
            description,
        } => {
            let id: TaskId = parse_id(&task)?;
            let ws = open(config, Access::Write)?;
            let finding = ws.graph.defer_finding(id, &category, &description)?;
            emit(config, &finding, |f| {
                println!(
                    "{} Logged {} against milestone {}",
                    style("✓").green(),
                    f.id,
                    f.milestone_id
                );
            })
        }
        FindingCommands::Promote {
            finding,
            milestone,
            title,
            creates,
            modifies,
            depends_on,
            criteria,
        } => {
            let id: FindingId = parse_id(&finding)?;
            let milestone: MilestoneId = parse_id(&milestone)?;
            let deps = depends_on
                .iter()
                .map(|d| parse_id::<TaskId>(d))
                .collect::<Result<Vec<_>>>()?;
            let mut spec = TaskSpec::new(milestone, title).depends_on(deps);
            for path in creates {
                spec = spec.scope(FileScopeEntry::create(path));
            }
            for path in modifies {
                spec = spec.scope(FileScopeEntry::modify(path));
            }
            for criterion in criteria {
                spec = spec.criterion(criterion);
            }
            let ws = open(config, Access::Write)?;
            let (finding, added) = ws.graph.promote_finding(id, &spec)?;

            #[derive(Serialize)]
            struct Promoted {
                finding: DeferredFinding,
                task: Task,
                warnings: Vec<String>,
            }
            let out = Promoted {
                finding,
                task: added.task,
                warnings: added.warnings.iter().map(|w| w.to_string()).collect(),
            };
            emit(config, &out, |out| {
                println!(
                    "{} {} promoted to {}: {}",
                    style("✓").green(),
                    out.finding.id,
                    out.task.id,
                    out.task.title
                );
                for warning in &out.warnings {
                    println!("{} {}", style("!").yellow(), warning);
                }
            })
        }
        FindingCommands::Defer { finding } => {
            let id: FindingId = parse_id(&finding)?;
            let ws = open(config, Access::Write)?;
            let finding = ws.graph.defer_again(id)?;
            emit(config, &finding, |f| println!("{} {} deferred", style("-").dim(), f.id))
        }
        FindingCommands::Dismiss { finding } => {
            let id: FindingId = parse_id(&finding)?;
            let ws = open(config, Access::Write)?;
            let finding = ws.graph.dismiss_finding(id)?;
            emit(config, &finding, |f| println!("{} {} dismissed", style("-").dim(), f.id))
        }
        FindingCommands::List { eligible } => {
            let ws = open(config, Access::Read)?;
            let findings = if eligible {
                ws.graph.eligible_findings()?
            } else {
                ws.graph.findings()?
            };
            emit(config, &findings, |findings| {
                if findings.is_empty() {
                    println!("No findings.");
                    return;
                }
                for f in findings {
                    let status = match f.status {
                        FindingStatus::Open => style(f.status.as_str()).yellow(),
                        _ => style(f.status.as_str()).dim(),
                    };
                    println!(
                        "  {:<7} {:<9} {:<5} {:<14} {}",
                        f.id.to_string(),
                        status,
                        f.milestone_id.as_str(),
                        f.category,
                        f.description
                    );
                }
            })
        }
    }
}
