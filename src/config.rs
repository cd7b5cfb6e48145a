//! Configuration for Foreman.
//!
//! Reads `.foreman/foreman.toml`; every section has defaults, so a missing
//! file is a valid configuration. Values layer file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [review]
//! max_task_cycles = 3
//! max_milestone_cycles = 2
//! reviewer_timeout_secs = 300
//! retry_unavailable = 1
//! parallel = true
//!
//! [review.routing]
//! security_patterns = ["**/auth/**", "**/*crypto*"]
//! style_patterns = ["**/*.css", "**/components/**"]
//!
//! [[reviewers]]
//! id = "correctness"
//! role = "correctness"
//! command = ["./scripts/review.sh", "--strict"]
//!
//! [verification]
//! command = ["cargo", "test"]
//! timeout_secs = 600
//!
//! [deconfliction]
//! resource_metrics = ["p99 latency"]
//!
//! [[deconfliction.exclusive_groups]]
//! name = "queue"
//! options = ["kafka", "rabbitmq|amqp"]
//!
//! [logging]
//! level = "info"
//! json = false
//! file = true
//! ```

use anyhow::{Context, Result};
use foreman_common::{Reviewer, ReviewerRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::decision::DeconflictionConfig;
use crate::graph::CyclePolicy;
use crate::review::selection::{DEFAULT_SECURITY_PATTERNS, DEFAULT_STYLE_PATTERNS};
use crate::review::{CommandReviewer, CommandVerifier, DEFAULT_REVIEWER_TIMEOUT_SECS, ReviewPolicy, Routing};

/// Name of the runtime directory inside a project.
pub const FOREMAN_DIR: &str = ".foreman";

/// Environment variable holding a log filter directive.
pub const LOG_ENV: &str = "FOREMAN_LOG";

/// Environment variable overriding the store path.
pub const DB_ENV: &str = "FOREMAN_DB";

/// `[review]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSection {
    /// Blocking review cycles before a task is escalated.
    #[serde(default = "default_max_task_cycles")]
    pub max_task_cycles: u32,
    #[serde(default = "default_max_milestone_cycles")]
    pub max_milestone_cycles: u32,
    #[serde(default = "default_reviewer_timeout_secs")]
    pub reviewer_timeout_secs: u64,
    /// Retries for an unavailable reviewer. Values above 1 are clamped.
    #[serde(default = "default_retry_unavailable")]
    pub retry_unavailable: u32,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    #[serde(default)]
    pub routing: RoutingSection,
}

fn default_max_task_cycles() -> u32 {
    3
}

fn default_max_milestone_cycles() -> u32 {
    2
}

fn default_reviewer_timeout_secs() -> u64 {
    DEFAULT_REVIEWER_TIMEOUT_SECS
}

fn default_retry_unavailable() -> u32 {
    1
}

fn default_parallel() -> bool {
    true
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            max_task_cycles: default_max_task_cycles(),
            max_milestone_cycles: default_max_milestone_cycles(),
            reviewer_timeout_secs: default_reviewer_timeout_secs(),
            retry_unavailable: default_retry_unavailable(),
            parallel: default_parallel(),
            routing: RoutingSection::default(),
        }
    }
}

/// `[review.routing]`: globs that pull in the conditional reviewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSection {
    #[serde(default = "default_security_patterns")]
    pub security_patterns: Vec<String>,
    #[serde(default = "default_style_patterns")]
    pub style_patterns: Vec<String>,
}

fn default_security_patterns() -> Vec<String> {
    DEFAULT_SECURITY_PATTERNS.iter().map(|s| s.to_string()).collect()
}

fn default_style_patterns() -> Vec<String> {
    DEFAULT_STYLE_PATTERNS.iter().map(|s| s.to_string()).collect()
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            security_patterns: default_security_patterns(),
            style_patterns: default_style_patterns(),
        }
    }
}

/// One `[[reviewers]]` entry: an external command speaking the JSON review
/// protocol on stdin/stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerConfig {
    pub id: String,
    pub role: ReviewerRole,
    pub command: Vec<String>,
}

/// `[verification]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSection {
    /// Argv run in the project root; exit status 0 means passing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_verification_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_verification_timeout_secs() -> u64 {
    600
}

impl Default for VerificationSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_verification_timeout_secs(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Filter directive, e.g. `info` or `foreman=debug`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// JSON lines on stderr instead of the human format.
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rolling file under `.foreman/logs/`.
    #[serde(default = "default_log_file")]
    pub file: bool,
}

fn default_log_file() -> bool {
    true
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
            file: default_log_file(),
        }
    }
}

/// The complete foreman.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForemanToml {
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub reviewers: Vec<ReviewerConfig>,
    #[serde(default)]
    pub verification: VerificationSection,
    #[serde(default)]
    pub deconfliction: DeconflictionConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ForemanToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `.foreman/foreman.toml`, or defaults when the file is absent.
    pub fn load_or_default(foreman_dir: &Path) -> Result<Self> {
        let config_path = foreman_dir.join("foreman.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Cycle ceilings, with zero values replaced by the defaults.
    pub fn cycle_policy(&self) -> CyclePolicy {
        let defaults = CyclePolicy::default();
        CyclePolicy {
            max_task_cycles: nonzero_or(self.review.max_task_cycles, defaults.max_task_cycles),
            max_milestone_cycles: nonzero_or(self.review.max_milestone_cycles, defaults.max_milestone_cycles),
        }
    }

    pub fn review_policy(&self) -> Result<ReviewPolicy> {
        let routing = Routing::new(
            &self.review.routing.security_patterns,
            &self.review.routing.style_patterns,
        )
        .context("Invalid pattern in [review.routing]")?;
        let timeout = nonzero_or(self.review.reviewer_timeout_secs, DEFAULT_REVIEWER_TIMEOUT_SECS);
        Ok(ReviewPolicy::default()
            .with_timeout(Duration::from_secs(timeout))
            .with_retry(self.review.retry_unavailable)
            .with_parallel(self.review.parallel)
            .with_routing(routing))
    }

    /// Reviewers backed by the configured commands, run from `project_dir`.
    pub fn reviewers(&self, project_dir: &Path) -> Vec<Arc<dyn Reviewer>> {
        self.reviewers
            .iter()
            .filter(|r| !r.command.is_empty())
            .map(|r| {
                Arc::new(
                    CommandReviewer::new(r.id.clone(), r.role, r.command.clone())
                        .with_working_dir(project_dir.to_path_buf()),
                ) as Arc<dyn Reviewer>
            })
            .collect()
    }

    pub fn verifier(&self) -> Option<CommandVerifier> {
        let command = self.verification.command.as_ref().filter(|c| !c.is_empty())?;
        Some(CommandVerifier::new(
            command.clone(),
            Duration::from_secs(nonzero_or(
                self.verification.timeout_secs,
                default_verification_timeout_secs(),
            )),
        ))
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.review.max_task_cycles == 0 {
            warnings.push(format!(
                "review.max_task_cycles = 0 is not allowed; using {}",
                default_max_task_cycles()
            ));
        }
        if self.review.max_milestone_cycles == 0 {
            warnings.push(format!(
                "review.max_milestone_cycles = 0 is not allowed; using {}",
                default_max_milestone_cycles()
            ));
        }
        if self.review.reviewer_timeout_secs == 0 {
            warnings.push(format!(
                "review.reviewer_timeout_secs = 0 is not allowed; using {}",
                DEFAULT_REVIEWER_TIMEOUT_SECS
            ));
        }
        if self.review.retry_unavailable > 1 {
            warnings.push(format!(
                "review.retry_unavailable = {} is clamped to 1",
                self.review.retry_unavailable
            ));
        }
        for (name, patterns) in [
            ("security_patterns", &self.review.routing.security_patterns),
            ("style_patterns", &self.review.routing.style_patterns),
        ] {
            for pattern in patterns {
                if let Err(e) = glob::Pattern::new(pattern) {
                    warnings.push(format!("Invalid glob '{}' in review.routing.{}: {}", pattern, name, e));
                }
            }
        }

        let mut seen = BTreeSet::new();
        for reviewer in &self.reviewers {
            if reviewer.id.trim().is_empty() {
                warnings.push("A [[reviewers]] entry has an empty id".to_string());
            } else if !seen.insert(reviewer.id.as_str()) {
                warnings.push(format!("Reviewer id '{}' is configured more than once", reviewer.id));
            }
            if reviewer.command.is_empty() {
                warnings.push(format!("Reviewer '{}' has an empty command and is ignored", reviewer.id));
            }
        }
        if !self.reviewers.is_empty()
            && !self.reviewers.iter().any(|r| r.role == ReviewerRole::Correctness)
        {
            warnings.push("No correctness reviewer configured; every task review will report a gap".to_string());
        }
        if self
            .verification
            .command
            .as_ref()
            .is_some_and(|c| c.is_empty())
        {
            warnings.push("verification.command is empty and is ignored".to_string());
        }

        warnings
    }
}

fn nonzero_or<T: Default + PartialEq>(value: T, fallback: T) -> T {
    if value == T::default() { fallback } else { value }
}

/// Configuration resolved for one invocation: foreman.toml plus environment
/// and CLI overrides.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    pub project_dir: PathBuf,
    pub foreman_dir: PathBuf,
    pub toml: ForemanToml,
    pub verbose: bool,
    /// Machine-readable output on stdout.
    pub json: bool,
}

impl ForemanConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let foreman_dir = project_dir.join(FOREMAN_DIR);
        let toml = ForemanToml::load_or_default(&foreman_dir)?;
        Ok(Self {
            project_dir,
            foreman_dir,
            toml,
            verbose: false,
            json: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, json: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.json = json;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.foreman_dir.join("foreman.toml")
    }

    /// Store path (env → default).
    pub fn db_path(&self) -> PathBuf {
        match std::env::var(DB_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => self.foreman_dir.join("foreman.db"),
        }
    }

    pub fn lock_file(&self) -> PathBuf {
        self.foreman_dir.join("foreman.lock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.foreman_dir.join("logs")
    }

    /// Log filter (env → CLI → file → default).
    pub fn log_filter(&self) -> String {
        if let Ok(filter) = std::env::var(LOG_ENV)
            && !filter.trim().is_empty()
        {
            return filter;
        }
        if self.verbose {
            return "debug".to_string();
        }
        self.toml
            .logging
            .level
            .clone()
            .unwrap_or_else(|| "info".to_string())
    }

    pub fn is_initialized(&self) -> bool {
        self.foreman_dir.is_dir()
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
