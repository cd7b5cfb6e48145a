//! Project-level commands: init, config, status, resume, log, validate,
//! checkpoint and rollback.

use anyhow::Result;
use console::style;
use serde::Serialize;
use std::collections::BTreeMap;

use foreman::CoreError;
use foreman::chain::{ChainEntry, ChainReport};
use foreman::config::{ForemanConfig, ForemanToml};
use foreman::graph::{GraphReport, TaskState};
use foreman::session::AwaitingInput;
use foreman::workspace::{self, Access};

use super::super::ConfigCommands;
use super::{emit, open};

pub fn cmd_init(config: &ForemanConfig) -> Result<()> {
    let result = workspace::init_project(&config.project_dir)?;
    #[derive(Serialize)]
    struct Initialized {
        foreman_dir: String,
        created: bool,
    }
    let out = Initialized {
        foreman_dir: result.foreman_dir.display().to_string(),
        created: result.created,
    };
    emit(config, &out, |out| {
        if out.created {
            println!("Initialized foreman in {}", out.foreman_dir);
        } else {
            println!("Already initialized: {}", out.foreman_dir);
        }
    })
}

pub fn cmd_config(config: &ForemanConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let path = config.config_file();
            if config.json {
                println!("{}", serde_json::to_string_pretty(&config.toml)?);
                return Ok(());
            }
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No foreman.toml at {}; using defaults", path.display());
            }
            println!();
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!("  store = \"{}\"", config.db_path().display());
            println!("  log filter = \"{}\"", config.log_filter());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let path = config.config_file();
            let toml = if path.exists() {
                ForemanToml::load(&path)?
            } else {
                ForemanToml::default()
            };
            let warnings = toml.validate();
            emit(config, &warnings, |warnings| {
                if warnings.is_empty() {
                    println!("{} Configuration is valid", style("✓").green());
                } else {
                    for warning in warnings {
                        println!("{} {}", style("!").yellow(), warning);
                    }
                }
            })?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusView {
    awaiting_input: Option<AwaitingInput>,
    current_task: Option<String>,
    tasks: BTreeMap<String, usize>,
    milestones: Vec<(String, String, u32)>,
    open_findings: usize,
    chain_entries: u64,
    reviewers: usize,
}

pub fn cmd_status(config: &ForemanConfig) -> Result<()> {
    let ws = open(config, Access::Read)?;
    let tasks = ws.graph.tasks()?;
    let mut by_state = BTreeMap::new();
    for task in &tasks {
        *by_state.entry(task.state.to_string()).or_insert(0) += 1;
    }
    let view = StatusView {
        awaiting_input: ws.session.awaiting()?,
        current_task: ws.graph.current_task_id()?.map(|id| id.to_string()),
        tasks: by_state,
        milestones: ws
            .graph
            .milestones()?
            .into_iter()
            .map(|m| (m.id.to_string(), m.state.to_string(), m.review_cycle_count))
            .collect(),
        open_findings: ws.graph.eligible_findings()?.len(),
        chain_entries: ws.chain.len()?,
        reviewers: config.toml.reviewers.len(),
    };

    emit(config, &view, |view| {
        println!();
        println!("Foreman Status");
        println!("==============");
        println!();
        match &view.awaiting_input {
            Some(awaiting) => println!(
                "Session: {} ({}, since {})",
                style("awaiting input").yellow().bold(),
                awaiting.reason,
                awaiting.raised_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("Session: {}", style("running").green()),
        }
        println!(
            "Current: {}",
            view.current_task.as_deref().unwrap_or("none")
        );
        println!();
        if view.tasks.is_empty() {
            println!("No tasks yet. Run 'foreman generate <plan.json>'.");
        } else {
            println!("Tasks:");
            for state in [
                TaskState::Pending,
                TaskState::InProgress,
                TaskState::UnderReview,
                TaskState::Done,
                TaskState::Blocked,
                TaskState::Cancelled,
            ] {
                if let Some(count) = view.tasks.get(state.as_str()) {
                    println!("  {:<14} {}", state.as_str(), count);
                }
            }
        }
        if !view.milestones.is_empty() {
            println!();
            println!("Milestones:");
            for (id, state, cycles) in &view.milestones {
                println!("  {:<6} {:<10} {} review cycle(s)", id, state, cycles);
            }
        }
        println!();
        println!("Findings ready for triage: {}", view.open_findings);
        println!("Audit chain entries:       {}", view.chain_entries);
        println!("Configured reviewers:      {}", view.reviewers);
        println!();
    })
}

pub fn cmd_resume(config: &ForemanConfig, note: &str) -> Result<()> {
    let ws = open(config, Access::Write)?;
    let cleared = ws.session.resume(note)?;
    emit(config, &cleared, |cleared| {
        println!("Resumed. Cleared: {}", cleared.reason);
    })
}

pub fn cmd_log(config: &ForemanConfig, limit: usize) -> Result<()> {
    let ws = open(config, Access::Read)?;
    let entries = ws.chain.entries(Some(limit))?;
    emit(config, &entries, |entries| {
        if entries.is_empty() {
            println!("Audit chain is empty.");
            return;
        }
        for entry in entries {
            print_entry(entry);
        }
    })
}

fn print_entry(entry: &ChainEntry) {
    println!(
        "{:>5}  {}  {:<22} {:<20} {}  {}",
        entry.sequence_no,
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.stage,
        entry.actor,
        entry.verdict.as_deref().unwrap_or("-"),
        style(&entry.entry_hash[..12.min(entry.entry_hash.len())]).dim()
    );
}

#[derive(Serialize)]
struct ValidationView {
    chain: ChainReport,
    graph: GraphReport,
    config_warnings: Vec<String>,
}

/// Chain verification plus graph invariants. Either failing is an integrity
/// error (exit 2).
pub fn cmd_validate(config: &ForemanConfig) -> Result<()> {
    let ws = open(config, Access::Read)?;
    let view = ValidationView {
        chain: ws.chain.verify()?,
        graph: ws.graph.validate()?,
        config_warnings: config.validate(),
    };
    emit(config, &view, |view| {
        if view.chain.valid {
            println!(
                "{} Audit chain: {} entries verified",
                style("✓").green(),
                view.chain.entries_checked
            );
        } else {
            println!("{} Audit chain broken at {:?}", style("✗").red(), view.chain.broken);
            for issue in &view.chain.issues {
                println!("    #{} {:?}", issue.sequence_no, issue.kind);
            }
        }
        if view.graph.is_valid() {
            println!(
                "{} Task graph: {} tasks consistent",
                style("✓").green(),
                view.graph.tasks_checked
            );
        } else {
            println!("{} Task graph invariants violated:", style("✗").red());
            for violation in &view.graph.violations {
                println!("    {}", violation);
            }
        }
        for warning in &view.config_warnings {
            println!("{} {}", style("!").yellow(), warning);
        }
    })?;

    view.chain.into_result().map_err(CoreError::from)?;
    view.graph.into_result()?;
    Ok(())
}

pub fn cmd_checkpoint(config: &ForemanConfig, label: &str) -> Result<()> {
    let ws = open(config, Access::Write)?;
    let checkpoint = ws.graph.checkpoint(label)?;
    emit(config, &checkpoint, |checkpoint| {
        println!(
            "Checkpoint '{}' saved ({} tasks, digest {})",
            checkpoint.label,
            checkpoint.snapshot.tasks.len(),
            &checkpoint.digest[..12.min(checkpoint.digest.len())]
        );
    })
}

pub fn cmd_rollback(config: &ForemanConfig, label: &str) -> Result<()> {
    let ws = open(config, Access::Write)?;
    let outcome = ws.graph.rollback(label)?;
    emit(config, &outcome, |outcome| {
        println!(
            "Rolled back to '{}': {} task(s) restored, {} cancelled",
            outcome.label,
            outcome.restored.len(),
            outcome.cancelled.len()
        );
    })
}
