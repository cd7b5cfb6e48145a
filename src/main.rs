use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Instrument;
use uuid::Uuid;

use foreman::config::ForemanConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Decision-gated task orchestration with audited review cycles")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .foreman/ with a default foreman.toml and an empty store
    Init,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Decision store operations
    Decision {
        #[command(subcommand)]
        command: DecisionCommands,
    },
    /// Build the concern index and report conflicts; exits 1 while any is unresolved
    Deconflict,
    /// Record a human resolution for a detected conflict
    ConflictResolve {
        /// Conflict id as printed by `foreman deconflict`
        id: String,
        /// accepted, amended or superseded
        #[arg(long = "as")]
        resolution: String,
        /// Decision being amended or superseded
        #[arg(long)]
        decision: Option<String>,
        /// Replacement text when amending
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        rationale: String,
    },
    /// Generate the task graph from a synthesis plan (JSON)
    Generate { plan: PathBuf },
    /// Show the next eligible task
    Next,
    /// pending -> in_progress
    TaskStart { task: String },
    /// under_review -> done
    TaskDone {
        task: String,
        /// Complete past the review ceiling; the reason is recorded
        #[arg(long = "override", value_name = "REASON")]
        override_reason: Option<String>,
    },
    /// Escalate a task to blocked
    TaskBlock {
        task: String,
        #[arg(long)]
        reason: String,
    },
    /// Explicit override: blocked -> in_progress with a fresh cycle allowance
    TaskUnblock {
        task: String,
        #[arg(long)]
        reason: String,
    },
    /// Mark a pending or blocked task cancelled
    TaskCancel {
        task: String,
        #[arg(long)]
        reason: String,
    },
    /// Show one task
    TaskShow { task: String },
    /// List tasks
    Tasks {
        /// Only tasks in this state
        #[arg(long)]
        state: Option<String>,
    },
    /// Run the configured verification command and record the result
    Verify {
        task: String,
        /// Record an externally obtained result instead: pass or fail
        #[arg(long)]
        result: Option<String>,
        /// Output to digest with a manual result
        #[arg(long, requires = "result")]
        output: Option<String>,
    },
    /// Record one reviewer verdict for the current cycle
    ReviewRecord {
        task: String,
        #[arg(long)]
        reviewer: String,
        /// pass, concern, block or unavailable
        #[arg(long)]
        verdict: String,
        #[arg(long = "finding")]
        findings: Vec<String>,
    },
    /// Aggregate the current cycle and apply it
    ReviewAdjudicate { task: String },
    /// Run a full review cycle with the configured reviewers
    ReviewRun { task: String },
    /// Show recorded reviews for a task or milestone
    Reviews { subject: String },
    /// Milestone integration review
    MilestoneReview {
        milestone: String,
        /// Record an operator verdict instead of invoking reviewers
        #[arg(long)]
        verdict: Option<String>,
    },
    /// Override a BLOCKED milestone: record the reason and allow another round of review cycles
    MilestoneUnblock {
        milestone: String,
        #[arg(long)]
        reason: String,
    },
    /// List milestones
    Milestones,
    /// Deferred findings
    Finding {
        #[command(subcommand)]
        command: FindingCommands,
    },
    /// Lessons learned
    Lesson {
        #[command(subcommand)]
        command: LessonCommands,
    },
    /// Per-task outcome telemetry
    Eval {
        #[command(subcommand)]
        command: EvalCommands,
    },
    /// Tail of the audit chain
    Log {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Verify the audit chain and graph invariants; exits 2 on failure
    Validate,
    /// Snapshot task and milestone states under a label
    Checkpoint { label: String },
    /// Restore a labelled snapshot
    Rollback { label: String },
    /// Session overview
    Status,
    /// Clear the awaiting-input flag
    Resume {
        #[arg(long)]
        note: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum DecisionCommands {
    /// Add one decision record
    Add {
        #[arg(long)]
        producer: String,
        #[arg(long)]
        text: String,
        /// Concern area tag; repeatable
        #[arg(long = "concern", required = true)]
        concerns: Vec<String>,
        /// Explicit id (TAG-NN); allocated when absent
        #[arg(long)]
        id: Option<String>,
        /// draft or confirmed
        #[arg(long)]
        status: Option<String>,
        /// Decision this one supersedes
        #[arg(long)]
        amends: Option<String>,
    },
    /// Import a JSON array of decision records
    Import { file: PathBuf },
    /// draft -> confirmed
    Confirm { id: String },
    /// Append a new revision
    Amend {
        id: String,
        #[arg(long)]
        text: String,
        /// Replace the concern areas; repeatable
        #[arg(long = "concern")]
        concerns: Vec<String>,
    },
    List,
    /// Show a decision with its revision history
    Show { id: String },
}

#[derive(Subcommand, Clone)]
pub enum FindingCommands {
    /// Log an out-of-scope finding against the active task
    Add {
        task: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        description: String,
    },
    /// Turn a finding of a complete milestone into a new task
    Promote {
        finding: String,
        #[arg(long)]
        milestone: String,
        #[arg(long)]
        title: String,
        /// File the task will create; repeatable
        #[arg(long = "create")]
        creates: Vec<String>,
        /// File the task will modify; repeatable
        #[arg(long = "modify")]
        modifies: Vec<String>,
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        #[arg(long = "criterion")]
        criteria: Vec<String>,
    },
    /// Push a finding past the current plan
    Defer { finding: String },
    Dismiss { finding: String },
    List {
        /// Only open findings of complete milestones
        #[arg(long)]
        eligible: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum LessonCommands {
    Add {
        #[arg(long)]
        summary: String,
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,
        #[arg(long)]
        task: Option<String>,
    },
    /// Lessons sharing at least one tag, most overlapping first
    Query {
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum EvalCommands {
    List {
        #[arg(long)]
        task: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let input_echo = std::env::args().collect::<Vec<_>>().join(" ");
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => ExitCode::from(cmd::report_error(&err, &input_echo)),
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = ForemanConfig::with_cli_args(project_dir, cli.verbose, cli.json)?;
    let _log_guard = foreman::logging::init(&config);

    // Every log line of one invocation carries the same id.
    let span = tracing::info_span!("invocation", id = %Uuid::new_v4());
    dispatch(&cli.command, &config).instrument(span).await
}

async fn dispatch(command: &Commands, config: &ForemanConfig) -> Result<()> {
    match command {
        Commands::Init => cmd::cmd_init(config),
        Commands::Config { command } => cmd::cmd_config(config, command.clone()),
        Commands::Decision { command } => cmd::cmd_decision(config, command.clone()),
        Commands::Deconflict => cmd::cmd_deconflict(config),
        Commands::ConflictResolve {
            id,
            resolution,
            decision,
            text,
            rationale,
        } => cmd::cmd_conflict_resolve(
            config,
            id,
            resolution,
            decision.as_deref(),
            text.as_deref(),
            rationale,
        ),
        Commands::Generate { plan } => cmd::cmd_generate(config, plan),
        Commands::Next => cmd::cmd_next(config),
        Commands::TaskStart { task } => cmd::cmd_task_start(config, task),
        Commands::TaskDone {
            task,
            override_reason,
        } => cmd::cmd_task_done(config, task, override_reason.as_deref()),
        Commands::TaskBlock { task, reason } => cmd::cmd_task_block(config, task, reason),
        Commands::TaskUnblock { task, reason } => cmd::cmd_task_unblock(config, task, reason),
        Commands::TaskCancel { task, reason } => cmd::cmd_task_cancel(config, task, reason),
        Commands::TaskShow { task } => cmd::cmd_task_show(config, task),
        Commands::Tasks { state } => cmd::cmd_tasks(config, state.as_deref()),
        Commands::Verify {
            task,
            result,
            output,
        } => cmd::cmd_verify(config, task, result.as_deref(), output.as_deref()).await,
        Commands::ReviewRecord {
            task,
            reviewer,
            verdict,
            findings,
        } => cmd::cmd_review_record(config, task, reviewer, verdict, findings),
        Commands::ReviewAdjudicate { task } => cmd::cmd_review_adjudicate(config, task),
        Commands::ReviewRun { task } => cmd::cmd_review_run(config, task).await,
        Commands::Reviews { subject } => cmd::cmd_reviews(config, subject),
        Commands::MilestoneReview { milestone, verdict } => {
            cmd::cmd_milestone_review(config, milestone, verdict.as_deref()).await
        }
        Commands::MilestoneUnblock { milestone, reason } => cmd::cmd_milestone_unblock(config, milestone, reason),
        Commands::Milestones => cmd::cmd_milestones(config),
        Commands::Finding { command } => cmd::cmd_finding(config, command.clone()),
        Commands::Lesson { command } => cmd::cmd_lesson(config, command.clone()),
        Commands::Eval { command } => cmd::cmd_eval(config, command.clone()),
        Commands::Log { limit } => cmd::cmd_log(config, *limit),
        Commands::Validate => cmd::cmd_validate(config),
        Commands::Checkpoint { label } => cmd::cmd_checkpoint(config, label),
        Commands::Rollback { label } => cmd::cmd_rollback(config, label),
        Commands::Status => cmd::cmd_status(config),
        Commands::Resume { note } => cmd::cmd_resume(config, note),
    }
}
