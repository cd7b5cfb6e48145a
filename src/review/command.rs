//! Collaborators backed by external commands.
//!
//! A command reviewer receives the [`ReviewRequest`] as JSON on stdin and
//! prints a [`ReviewResponse`] as JSON on stdout (a fenced ```json block or
//! the first top-level object in the output is accepted). A verifier command
//! runs in the project root and passes when it exits zero.
//!
//! Timeouts are applied by the caller; children are killed when dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use foreman_common::{
    ReviewRequest, ReviewResponse, Reviewer, ReviewerRole, TaskId, VerificationResult, Verifier,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

fn command_for(argv: &[String]) -> Result<Command> {
    let (program, args) = argv.split_first().context("Empty command")?;
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    Ok(cmd)
}

/// Reviewer that shells out to `argv`.
#[derive(Debug, Clone)]
pub struct CommandReviewer {
    id: String,
    role: ReviewerRole,
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandReviewer {
    pub fn new(id: impl Into<String>, role: ReviewerRole, argv: Vec<String>) -> Self {
        Self {
            id: id.into(),
            role,
            argv,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> ReviewerRole {
        self.role
    }

    async fn review(&self, request: &ReviewRequest) -> Result<ReviewResponse> {
        let mut cmd = command_for(&self.argv)?;
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.env("FOREMAN_REVIEWER", &self.id)
            .env("FOREMAN_SUBJECT", request.subject.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let payload = serde_json::to_vec(request)?;
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn reviewer '{}'", self.id))?;

        // Feed stdin while draining stdout so neither pipe fills up and stalls
        // the other.
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.context("Failed to wait for reviewer process")?;
        if let Err(e) = written {
            tracing::debug!(reviewer = %self.id, error = %e, "reviewer closed stdin before reading the request");
        }
        if !output.status.success() {
            bail!(
                "Reviewer '{}' exited with code {}: {}",
                self.id,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_response(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("Reviewer '{}' printed no valid verdict", self.id))
    }
}

/// Pull a [`ReviewResponse`] out of free-form reviewer output.
pub fn parse_response(output: &str) -> Result<ReviewResponse> {
    let json = extract_json(output).context("No JSON object in output")?;
    Ok(serde_json::from_str(&json)?)
}

fn extract_json(output: &str) -> Option<String> {
    if let Some(start) = output.find("```json") {
        let after_marker = &output[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    let start = output.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in output[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(output[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Verifier that runs `argv` in the project root.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(&self, task_id: TaskId, project_root: &Path) -> Result<VerificationResult> {
        let mut cmd = command_for(&self.argv)?;
        cmd.current_dir(project_root)
            .env("FOREMAN_TASK", task_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().context("Failed to spawn verification command")?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("Verification timed out after {}s", self.timeout.as_secs()))?
            .context("Failed to wait for verification command")?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str(&stderr);
        }
        Ok(VerificationResult {
            passed: output.status.success(),
            output: text,
        })
    }
}
