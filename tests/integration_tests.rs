//! Integration tests for Foreman
//!
//! These drive the binary end to end against a temporary project.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a foreman Command rooted in `dir` with quiet logging
fn foreman(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("foreman");
    cmd.current_dir(dir.path())
        .env("FOREMAN_LOG", "warn")
        .env_remove("FOREMAN_DB");
    cmd
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Helper to initialize a foreman project in a temp directory
fn init_project(dir: &TempDir) {
    foreman(dir).arg("init").assert().success();
}

/// Run a command with `--json` and parse its stdout.
fn json(dir: &TempDir, args: &[&str]) -> serde_json::Value {
    let output = foreman(dir).arg("--json").args(args).output().unwrap();
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout of {:?} is not JSON ({e}): {}",
            args,
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

const PLAN: &str = r#"{
  "milestones": [{ "id": "M1", "name": "Auth core" }],
  "tasks": [
    {
      "id": "T01",
      "milestone": "M1",
      "title": "Session cookie middleware",
      "decision_refs": ["SECU-001"],
      "file_scope": ["src/middleware.rs"],
      "acceptance_criteria": ["cookie is httpOnly"]
    },
    {
      "id": "T02",
      "milestone": "M1",
      "title": "Login endpoint",
      "depends_on": ["T01"],
      "decision_refs": ["SECU-001"],
      "file_scope": [{ "path": "src/login.rs", "action": "create" }]
    }
  ]
}"#;

/// Initialized project with one confirmed decision and the two-task plan
fn planned_project() -> TempDir {
    let dir = create_temp_project();
    init_project(&dir);
    foreman(&dir)
        .args([
            "decision",
            "add",
            "--producer",
            "security",
            "--id",
            "SECU-001",
            "--status",
            "confirmed",
            "--text",
            "Keep session tokens in httpOnly cookies.",
            "--concern",
            "authentication",
        ])
        .assert()
        .success();
    fs::write(dir.path().join("plan.json"), PLAN).unwrap();
    foreman(&dir)
        .args(["generate", "plan.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Generated 1 milestone(s) and 2 task(s)"));
    dir
}

/// Start, verify, pass and adjudicate one task
fn complete_task(dir: &TempDir, task: &str) {
    foreman(dir).args(["task-start", task]).assert().success();
    foreman(dir)
        .args(["verify", task, "--result", "pass", "--output", "all tests passed"])
        .assert()
        .success();
    foreman(dir)
        .args(["review-record", task, "--reviewer", "alice", "--verdict", "pass"])
        .assert()
        .success();
    foreman(dir)
        .args(["review-adjudicate", task])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{} is now done", task)));
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_foreman_help() {
        let dir = create_temp_project();
        foreman(&dir).arg("--help").assert().success();
    }

    #[test]
    fn test_foreman_version() {
        let dir = create_temp_project();
        foreman(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();
        foreman(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized foreman"));

        assert!(dir.path().join(".foreman/foreman.toml").exists());
        assert!(dir.path().join(".foreman/foreman.db").exists());
        assert!(dir.path().join(".foreman/logs").is_dir());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = create_temp_project();
        init_project(&dir);
        foreman(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Already initialized"));
    }

    #[test]
    fn test_unknown_subcommand_exits_one() {
        let dir = create_temp_project();
        foreman(&dir).arg("frobnicate").assert().failure().code(1);
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        init_project(&dir);
        foreman(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_task_cycles = 3"));
    }
}

// =============================================================================
// Error payloads
// =============================================================================

mod errors {
    use super::*;

    #[test]
    fn test_uninitialized_project_is_reported() {
        let dir = create_temp_project();
        foreman(&dir)
            .arg("status")
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("foreman init"))
            .stderr(predicate::str::contains("\"fix_hint\""));
    }

    #[test]
    fn test_unknown_task_is_a_contract_error() {
        let dir = create_temp_project();
        init_project(&dir);
        foreman(&dir)
            .args(["task-start", "T99"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("\"class\":\"contract\""))
            .stderr(predicate::str::contains("task-start T99"));
    }

    #[test]
    fn test_malformed_id_is_a_contract_error() {
        let dir = create_temp_project();
        init_project(&dir);
        foreman(&dir)
            .args(["task-show", "banana"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("\"class\":\"contract\""));
    }

    #[test]
    fn test_invalid_verdict_is_rejected() {
        let dir = planned_project();
        foreman(&dir).args(["task-start", "T01"]).assert().success();
        foreman(&dir)
            .args(["review-record", "T01", "--reviewer", "alice", "--verdict", "maybe"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("Invalid verdict"));
    }
}

// =============================================================================
// Decisions and deconfliction
// =============================================================================

mod decisions {
    use super::*;

    fn add(dir: &TempDir, producer: &str, id: &str, text: &str) {
        foreman(dir)
            .args([
                "decision",
                "add",
                "--producer",
                producer,
                "--id",
                id,
                "--text",
                text,
                "--concern",
                "authentication",
            ])
            .assert()
            .success();
    }

    #[test]
    fn test_add_confirm_and_list() {
        let dir = create_temp_project();
        init_project(&dir);
        add(&dir, "auth", "AUTH-001", "Hash passwords with argon2id.");

        foreman(&dir)
            .args(["decision", "confirm", "AUTH-001"])
            .assert()
            .success()
            .stdout(predicate::str::contains("AUTH-001 confirmed"));

        let listed = json(&dir, &["decision", "list"]);
        assert_eq!(listed[0]["id"], "AUTH-001");
        assert_eq!(listed[0]["status"], "confirmed");
    }

    #[test]
    fn test_import_rejects_malformed_file() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(dir.path().join("decisions.json"), r#"{"not": "an array"}"#).unwrap();
        foreman(&dir)
            .args(["decision", "import", "decisions.json"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("\"class\":\"contract\""));
    }

    #[test]
    fn test_contradiction_blocks_until_resolved() {
        let dir = create_temp_project();
        init_project(&dir);
        add(&dir, "auth", "AUTH-001", "Store session tokens in localStorage on the client.");
        add(&dir, "security", "SECU-001", "Keep session tokens in httpOnly cookies.");

        let output = foreman(&dir).args(["--json", "deconflict"]).output().unwrap();
        assert_eq!(output.status.code(), Some(1));
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let conflict = report["unresolved"][0]["id"].as_str().unwrap().to_string();
        assert!(String::from_utf8_lossy(&output.stderr).contains("\"class\":\"invariant\""));

        foreman(&dir)
            .args([
                "conflict-resolve",
                &conflict,
                "--as",
                "accepted",
                "--rationale",
                "both are fine",
            ])
            .assert()
            .failure()
            .code(1);

        foreman(&dir)
            .args([
                "conflict-resolve",
                &conflict,
                "--as",
                "superseded",
                "--decision",
                "AUTH-001",
                "--rationale",
                "cookies are the security baseline",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("resolved as superseded"));

        foreman(&dir)
            .arg("deconflict")
            .assert()
            .success()
            .stdout(predicate::str::contains("No conflicts detected"));
    }
}

// =============================================================================
// Task lifecycle and reviews
// =============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_next_respects_dependencies() {
        let dir = planned_project();
        foreman(&dir)
            .arg("next")
            .assert()
            .success()
            .stdout(predicate::str::contains("T01"));
        foreman(&dir).args(["task-start", "T02"]).assert().failure().code(1);
    }

    #[test]
    fn test_task_reaches_done_through_review() {
        let dir = planned_project();
        complete_task(&dir, "T01");

        let done = json(&dir, &["tasks", "--state", "done"]);
        assert_eq!(done.as_array().unwrap().len(), 1);
        assert_eq!(done[0]["id"], "T01");

        let evals = json(&dir, &["eval", "list"]);
        assert_eq!(evals["summary"]["done"], 1);
        assert_eq!(evals["records"][0]["cycles_used"], 1);
    }

    #[test]
    fn test_adjudicate_without_verification_is_refused() {
        let dir = planned_project();
        foreman(&dir).args(["task-start", "T01"]).assert().success();
        foreman(&dir)
            .args(["review-record", "T01", "--reviewer", "alice", "--verdict", "pass"])
            .assert()
            .success();
        foreman(&dir)
            .args(["review-adjudicate", "T01"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("foreman verify T01"));
    }

    #[test]
    fn test_block_returns_task_for_fix() {
        let dir = planned_project();
        foreman(&dir).args(["task-start", "T01"]).assert().success();
        foreman(&dir)
            .args([
                "review-record",
                "T01",
                "--reviewer",
                "alice",
                "--verdict",
                "block",
                "--finding",
                "missing tests",
            ])
            .assert()
            .success();
        foreman(&dir)
            .args(["review-adjudicate", "T01"])
            .assert()
            .success()
            .stdout(predicate::str::contains("T01 is now in_progress"));

        foreman(&dir)
            .args(["reviews", "T01"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cycle 1: BLOCK"))
            .stdout(predicate::str::contains("missing tests"));

        let task = json(&dir, &["task-show", "T01"]);
        assert_eq!(task["review_cycle_count"], 1);
    }

    #[test]
    fn test_duplicate_verdict_is_refused() {
        let dir = planned_project();
        foreman(&dir).args(["task-start", "T01"]).assert().success();
        let record = ["review-record", "T01", "--reviewer", "alice", "--verdict", "pass"];
        foreman(&dir).args(record).assert().success();
        foreman(&dir).args(record).assert().failure().code(1);
    }

    #[test]
    fn test_milestone_completes_after_its_tasks() {
        let dir = planned_project();
        complete_task(&dir, "T01");

        foreman(&dir)
            .args(["milestone-review", "M1", "--verdict", "pass"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("\"class\":\"invariant\""));

        complete_task(&dir, "T02");
        foreman(&dir)
            .args(["milestone-review", "M1", "--verdict", "pass"])
            .assert()
            .success()
            .stdout(predicate::str::contains("MILESTONE_COMPLETE"));

        let milestones = json(&dir, &["milestones"]);
        assert_eq!(milestones[0]["state"], "complete");
    }

    #[test]
    fn test_blocked_milestone_needs_explicit_unblock() {
        let dir = planned_project();
        complete_task(&dir, "T01");
        complete_task(&dir, "T02");

        foreman(&dir)
            .args(["milestone-review", "M1", "--verdict", "block"])
            .assert()
            .success()
            .stdout(predicate::str::contains("NEEDS_FIX"));
        foreman(&dir)
            .args(["milestone-review", "M1", "--verdict", "block"])
            .assert()
            .success()
            .stdout(predicate::str::contains("BLOCKED"));

        foreman(&dir)
            .args(["milestone-review", "M1", "--verdict", "pass"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("milestone-unblock M1"));
        assert_eq!(json(&dir, &["milestones"])[0]["state"], "open");

        foreman(&dir)
            .args(["milestone-unblock", "M1", "--reason", "integration suite repaired"])
            .assert()
            .success()
            .stdout(predicate::str::contains("M1 may take 2 more review cycle(s)"));
        foreman(&dir)
            .args(["milestone-review", "M1", "--verdict", "pass"])
            .assert()
            .success()
            .stdout(predicate::str::contains("MILESTONE_COMPLETE"));
    }
}

// =============================================================================
// Session, findings, telemetry
// =============================================================================

mod session {
    use super::*;

    #[test]
    fn test_escalation_pauses_until_resume() {
        let dir = planned_project();
        foreman(&dir).args(["task-start", "T01"]).assert().success();
        foreman(&dir)
            .args(["task-block", "T01", "--reason", "needs a product call"])
            .assert()
            .success();

        foreman(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("awaiting input"));

        foreman(&dir)
            .args(["resume", "--note", "product says cookies"])
            .assert()
            .success()
            .stdout(predicate::str::contains("needs a product call"));

        foreman(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("running"));
    }

    #[test]
    fn test_resume_without_pause_is_refused() {
        let dir = create_temp_project();
        init_project(&dir);
        foreman(&dir)
            .args(["resume", "--note", "nothing to do"])
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn test_findings_wait_for_milestone() {
        let dir = planned_project();
        foreman(&dir).args(["task-start", "T01"]).assert().success();
        let finding = json(
            &dir,
            &[
                "finding",
                "add",
                "T01",
                "--category",
                "perf",
                "--description",
                "token lookup is linear",
            ],
        );
        let id = finding["id"].as_str().unwrap().to_string();
        assert_eq!(finding["status"], "open");

        foreman(&dir)
            .args(["finding", "dismiss", &id])
            .assert()
            .failure()
            .code(1);
        let eligible = json(&dir, &["finding", "list", "--eligible"]);
        assert!(eligible.as_array().unwrap().is_empty());
    }

    #[test]
    fn test_lessons_are_queried_by_tag() {
        let dir = create_temp_project();
        init_project(&dir);
        foreman(&dir)
            .args([
                "lesson",
                "add",
                "--summary",
                "Rotate signing keys before expiry",
                "--tag",
                "Authentication",
            ])
            .assert()
            .success();

        foreman(&dir)
            .args(["lesson", "query", "--tag", "authentication"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Rotate signing keys"));
        foreman(&dir)
            .args(["lesson", "query", "--tag", "billing"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No lessons match"));
    }

    #[test]
    fn test_task_start_shows_relevant_lessons() {
        let dir = planned_project();
        foreman(&dir)
            .args([
                "lesson",
                "add",
                "--summary",
                "Set SameSite on session cookies",
                "--tag",
                "authentication",
            ])
            .assert()
            .success();

        foreman(&dir)
            .args(["task-start", "T01"])
            .assert()
            .success()
            .stdout(predicate::str::contains("T01 in progress"))
            .stdout(predicate::str::contains("Set SameSite on session cookies"));
    }
}

// =============================================================================
// Audit chain and checkpoints
// =============================================================================

mod integrity {
    use super::*;

    #[test]
    fn test_validate_and_log() {
        let dir = planned_project();
        complete_task(&dir, "T01");

        foreman(&dir)
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("entries verified"));

        let entries = json(&dir, &["log", "-n", "3"]);
        assert_eq!(entries.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_tampered_chain_exits_two() {
        let dir = planned_project();
        let db = dir.path().join(".foreman/foreman.db");
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch(
            "DROP TRIGGER chain_entries_no_update;
             UPDATE chain_entries SET actor = 'mallory' WHERE seq = 1;",
        )
        .unwrap();
        drop(conn);

        foreman(&dir)
            .arg("validate")
            .assert()
            .failure()
            .code(2)
            .stderr(predicate::str::contains("\"class\":\"integrity\""));
    }

    #[test]
    fn test_forged_timestamp_exits_two_with_index() {
        let dir = planned_project();
        let db = dir.path().join(".foreman/foreman.db");
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch(
            "DROP TRIGGER chain_entries_no_update;
             UPDATE chain_entries SET timestamp = '2026-13-99 forged' WHERE seq = 2;",
        )
        .unwrap();
        drop(conn);

        foreman(&dir)
            .arg("validate")
            .assert()
            .failure()
            .code(2)
            .stdout(predicate::str::contains("Audit chain broken at [2]"))
            .stderr(predicate::str::contains("\"class\":\"integrity\""));
    }

    #[test]
    fn test_rollback_restores_checkpoint() {
        let dir = planned_project();
        foreman(&dir)
            .args(["checkpoint", "planned"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Checkpoint 'planned' saved"));
        foreman(&dir).args(["task-start", "T01"]).assert().success();

        foreman(&dir)
            .args(["rollback", "planned"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 task(s) restored"));

        let task = json(&dir, &["task-show", "T01"]);
        assert_eq!(task["state"], "pending");

        foreman(&dir).args(["rollback", "nope"]).assert().failure().code(1);
    }
}
