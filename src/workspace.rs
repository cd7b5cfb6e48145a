//! A project's `.foreman/` directory and the components built on it.
//!
//! ```text
//! .foreman/
//! ├── foreman.toml
//! ├── foreman.db
//! ├── foreman.lock
//! └── logs/
//! ```

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chain::AuditChain;
use crate::config::{FOREMAN_DIR, ForemanConfig, ForemanToml};
use crate::decision::DecisionStore;
use crate::events::{EventBus, TracingSubscriber};
use crate::graph::TaskGraph;
use crate::review::{CommandVerifier, ReviewController};
use crate::session::Session;
use crate::store::{Store, StoreHandle};
use crate::telemetry::Telemetry;

/// Result of `foreman init`.
#[derive(Debug)]
pub struct InitResult {
    pub foreman_dir: PathBuf,
    /// `false` when the directory already existed.
    pub created: bool,
}

/// Create `.foreman/`, a default `foreman.toml` and the store. Existing
/// files are left untouched.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let foreman_dir = project_dir.join(FOREMAN_DIR);
    let created = !foreman_dir.exists();

    std::fs::create_dir_all(foreman_dir.join("logs"))
        .with_context(|| format!("Failed to create directory: {}", foreman_dir.display()))?;

    let config_path = foreman_dir.join("foreman.toml");
    if !config_path.exists() {
        ForemanToml::default().save(&config_path)?;
    }

    let config = ForemanConfig::new(project_dir.to_path_buf())?;
    let _lock = WriteLock::acquire(&config.lock_file())?;
    Store::open(&config.db_path())
        .with_context(|| format!("Failed to create store: {}", config.db_path().display()))?;

    Ok(InitResult { foreman_dir, created })
}

/// Exclusive advisory lock on `.foreman/foreman.lock`, released on drop.
#[derive(Debug)]
pub struct WriteLock {
    _file: File,
    path: PathBuf,
}

impl WriteLock {
    /// Take the lock without waiting; another writer means an error.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        // fs2's method, not the std one that shadows it on newer toolchains.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "write lock acquired");
                Ok(Self {
                    _file: file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => anyhow::bail!(
                "Another foreman process is writing to this project (lock held on {})",
                path.display()
            ),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether a command may mutate the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Every core component, sharing one store handle and one event bus.
#[derive(Clone)]
pub struct Workspace {
    pub config: ForemanConfig,
    pub store: StoreHandle,
    pub events: EventBus,
    pub chain: AuditChain,
    pub decisions: DecisionStore,
    pub graph: TaskGraph,
    pub telemetry: Telemetry,
    pub session: Session,
    _lock: Option<Arc<WriteLock>>,
}

impl Workspace {
    pub fn open(config: ForemanConfig, access: Access) -> Result<Self> {
        if !config.is_initialized() {
            anyhow::bail!(
                "No {} directory in {}. Run 'foreman init' first.",
                FOREMAN_DIR,
                config.project_dir.display()
            );
        }
        let lock = match access {
            Access::Write => Some(Arc::new(WriteLock::acquire(&config.lock_file())?)),
            Access::Read => None,
        };

        let db_path = config.db_path();
        let store = StoreHandle::new(
            Store::open(&db_path).with_context(|| format!("Failed to open store: {}", db_path.display()))?,
        );
        let events = EventBus::new().with_subscriber(Arc::new(TracingSubscriber));
        let decisions = DecisionStore::with_config(store.clone(), &config.toml.deconfliction)?;
        let graph = TaskGraph::new(store.clone(), config.toml.cycle_policy()).with_events(events.clone());

        Ok(Self {
            chain: AuditChain::new(store.clone()),
            telemetry: Telemetry::new(store.clone()),
            session: Session::new(store.clone()),
            decisions,
            graph,
            events,
            store,
            config,
            _lock: lock,
        })
    }

    /// Review controller with the configured reviewers and policy.
    pub fn review_controller(&self) -> Result<ReviewController> {
        Ok(
            ReviewController::new(self.store.clone(), self.graph.clone(), self.telemetry.clone())
                .with_reviewers(self.config.toml.reviewers(&self.config.project_dir))
                .with_policy(self.config.toml.review_policy()?)
                .with_events(self.events.clone()),
        )
    }

    pub fn verifier(&self) -> Option<CommandVerifier> {
        self.config.toml.verifier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_creates_layout_once() {
        let dir = tempdir().unwrap();
        let first = init_project(dir.path()).unwrap();
        assert!(first.created);
        assert!(first.foreman_dir.join("foreman.toml").exists());
        assert!(first.foreman_dir.join("logs").is_dir());

        let second = init_project(dir.path()).unwrap();
        assert!(!second.created);
    }

    #[test]
    fn open_requires_init() {
        let dir = tempdir().unwrap();
        let config = ForemanConfig::new(dir.path().to_path_buf()).unwrap();
        let err = Workspace::open(config, Access::Read).err().unwrap();
        assert!(err.to_string().contains("foreman init"));
    }

    #[test]
    fn second_writer_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreman.lock");
        let held = WriteLock::acquire(&path).unwrap();
        let err = WriteLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("Another foreman process"));
        drop(held);
        assert!(WriteLock::acquire(&path).is_ok());
    }
}
