use anyhow::Result;
use console::style;
use serde::Serialize;

use foreman::config::ForemanConfig;
use foreman::telemetry::{EvalOutcome, EvalRecord, EvalSummary};
use foreman::workspace::Access;
use foreman_common::TaskId;

use super::super::{EvalCommands, LessonCommands};
use super::{emit, open, parse_id};

pub fn cmd_lesson(config: &ForemanConfig, command: LessonCommands) -> Result<()> {
    match command {
        LessonCommands::Add { summary, tags, task } => {
            let task = task.as_deref().map(parse_id::<TaskId>).transpose()?;
            let ws = open(config, Access::Write)?;
            let lesson = ws.telemetry.record_lesson(&summary, &tags, task)?;
            emit(config, &lesson, |l| {
                println!("{} Lesson #{} recorded", style("✓").green(), l.id);
            })
        }
        LessonCommands::Query { tags } => {
            let ws = open(config, Access::Read)?;
            let lessons = ws.telemetry.query_lessons(&tags)?;
            emit(config, &lessons, |lessons| {
                if lessons.is_empty() {
                    println!("No lessons match.");
                    return;
                }
                for l in lessons {
                    let tags: Vec<&str> = l.tags.iter().map(String::as_str).collect();
                    println!(
                        "  #{:<4} [{}] {}{}",
                        l.id,
                        tags.join(", "),
                        l.summary,
                        l.task_id.map(|t| format!(" ({})", t)).unwrap_or_default()
                    );
                }
            })
        }
    }
}

pub fn cmd_eval(config: &ForemanConfig, command: EvalCommands) -> Result<()> {
    let EvalCommands::List { task } = command;
    let task = task.as_deref().map(parse_id::<TaskId>).transpose()?;
    let ws = open(config, Access::Read)?;
    let records = ws.telemetry.evals(task)?;

    #[derive(Serialize)]
    struct Evals {
        summary: EvalSummary,
        records: Vec<EvalRecord>,
    }
    let out = Evals {
        summary: EvalSummary::from_records(&records),
        records,
    };
    emit(config, &out, |out| {
        if out.records.is_empty() {
            println!("No evals recorded.");
            return;
        }
        for r in &out.records {
            let outcome = match r.outcome {
                EvalOutcome::Done => style(r.outcome.as_str()).green(),
                EvalOutcome::Blocked => style(r.outcome.as_str()).red(),
                EvalOutcome::Cancelled => style(r.outcome.as_str()).dim(),
            };
            println!(
                "  {:<5} {:<10} cycles {:<2} gaps {:<2} findings {:<3} {:.1}s",
                r.task_id.to_string(),
                outcome,
                r.cycles_used,
                r.reviewer_gaps,
                r.findings_count,
                r.duration_ms as f64 / 1000.0
            );
        }
        let s = &out.summary;
        println!();
        println!(
            "{} task(s): {} done, {} blocked, {:.2} cycles on average, {} reviewer gap(s)",
            s.tasks, s.done, s.blocked, s.average_cycles, s.total_gaps
        );
    })
}
