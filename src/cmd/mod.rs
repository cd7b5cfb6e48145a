//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                                                    |
//! |-------------|---------------------------------------------------------------------|
//! | `project`   | `Init`, `Config`, `Status`, `Resume`, `Log`, `Validate`, `Checkpoint`, `Rollback` |
//! | `decision`  | `Decision`, `Deconflict`, `ConflictResolve`, `Generate`             |
//! | `task`      | `Next`, `Task*`, `Tasks`, `Verify`, `Finding`, `Milestones`          |
//! | `review`    | `ReviewRecord`, `ReviewAdjudicate`, `ReviewRun`, `Reviews`, `MilestoneReview` |
//! | `telemetry` | `Lesson`, `Eval`                                                    |
//!
//! Commands return `anyhow::Result`; [`report_error`] turns a failure into the
//! stderr payload and exit code.

pub mod decision;
pub mod project;
pub mod review;
pub mod task;
pub mod telemetry;

pub use decision::{cmd_conflict_resolve, cmd_decision, cmd_deconflict, cmd_generate};
pub use project::{
    cmd_checkpoint, cmd_config, cmd_init, cmd_log, cmd_resume, cmd_rollback, cmd_status, cmd_validate,
};
pub use review::{
    cmd_milestone_review, cmd_milestone_unblock, cmd_review_adjudicate, cmd_review_record, cmd_review_run,
    cmd_reviews,
};
pub use task::{
    cmd_finding, cmd_milestones, cmd_next, cmd_task_block, cmd_task_cancel, cmd_task_done, cmd_task_show,
    cmd_task_start, cmd_task_unblock, cmd_tasks, cmd_verify,
};
pub use telemetry::{cmd_eval, cmd_lesson};

use anyhow::Result;
use serde::Serialize;
use std::str::FromStr;

use foreman::CoreError;
use foreman::config::ForemanConfig;
use foreman::workspace::{Access, Workspace};

/// Open the workspace; mutating commands take the write lock.
pub(crate) fn open(config: &ForemanConfig, access: Access) -> Result<Workspace> {
    Workspace::open(config.clone(), access)
}

/// Parse an identifier, reporting a malformed one as a contract error.
pub(crate) fn parse_id<T>(raw: &str) -> Result<T>
where
    T: FromStr,
    CoreError: From<T::Err>,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::Error::from(CoreError::from(e)))
}

/// Parse an enum-like argument (verdicts, states, resolutions).
pub(crate) fn parse_arg<T>(raw: &str) -> Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    raw.parse::<T>()
        .map_err(|e| anyhow::Error::from(CoreError::from(foreman::errors::ContractError::Invalid(e.to_string()))))
}

/// Print `value` as JSON when `--json` is set, otherwise run `human`.
pub(crate) fn emit<T: Serialize>(config: &ForemanConfig, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if config.json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

/// Print the error payload on stderr and return the exit code.
pub fn report_error(err: &anyhow::Error, input_echo: &str) -> u8 {
    let (class, code, fix_hint) = match err.downcast_ref::<CoreError>() {
        Some(core) => (core.class().to_string(), core.exit_code(), core.fix_hint()),
        None => (
            "usage".to_string(),
            1,
            "Check the arguments and the .foreman directory; see `foreman --help`".to_string(),
        ),
    };
    let payload = serde_json::json!({
        "error": format!("{:#}", err),
        "class": class,
        "fix_hint": fix_hint,
        "input_echo": input_echo,
    });
    eprintln!("{}", payload);
    code as u8
}
