//! familiard - workflow orchestration daemon.
//!
//! Library components for the daemon process: the workflow engine and the services it
//! drives, plus [`Daemon`], which wires them together for one repository.

pub mod agent;
pub mod engine;
pub mod events;
pub mod git;
pub mod persist;
pub mod procinfo;
pub mod questions;
pub mod records;
pub mod recovery;
pub mod scheduler;
pub mod script;
pub mod server;
pub mod storage;
pub mod tasks;
pub mod timeout;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent::{AgentProvider, ProcessProvider, ProcessProviderConfig};
use engine::{Engine, EngineDeps, EngineSettings};
use events::EventBus;
use familiar_core::{BuiltinSet, Config, Loader};
use questions::QuestionStore;
use records::ProcessRecordStore;
use recovery::RecoveryCoordinator;
use scheduler::AgentSlots;
use serde::Deserialize;
use storage::Storage;
use tasks::{CommandTaskSource, TaskSource};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use worktree::{WorktreeManager, WorktreeSettings};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7710;

/// Name of the optional daemon settings file in the state directory.
pub const DAEMON_CONFIG_FILE: &str = "familiard.toml";

/// How long shutdown waits for workflow runs to wind down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] familiar_core::config::ConfigError),
    #[error("invalid {path}: {source}")]
    DaemonConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Storage(#[from] storage::StorageError),
    #[error(transparent)]
    Questions(#[from] questions::QuestionStoreError),
    #[error(transparent)]
    Records(#[from] records::RecordStoreError),
    #[error(transparent)]
    TaskSource(#[from] tasks::TaskSourceError),
    #[error(transparent)]
    Recovery(#[from] recovery::RecoveryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Daemon process settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Repository the daemon orchestrates.
    pub workspace_root: PathBuf,
    /// Question records, agent process records and the default database live here.
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub port: u16,
    /// Bearer token for the HTTP API.
    pub auth_token: Option<String>,
}

/// Values accepted in `familiard.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonFileConfig {
    pub state_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub auth_token: Option<String>,
}

impl DaemonConfig {
    /// Defaults for a repository: state under `$XDG_DATA_HOME/familiard/<repo>`.
    pub fn for_workspace(workspace_root: &Path) -> Self {
        let state_dir = default_state_dir(workspace_root);
        Self {
            workspace_root: workspace_root.to_path_buf(),
            db_path: state_dir.join("familiard.db"),
            state_dir,
            port: DEFAULT_PORT,
            auth_token: std::env::var("FAMILIARD_AUTH_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
        }
    }

    /// Merge values from a TOML settings file. A missing file is not an error.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(path)?;
        let file: DaemonFileConfig =
            toml::from_str(&content).map_err(|source| DaemonError::DaemonConfig {
                path: path.to_path_buf(),
                source,
            })?;
        self.apply(file);
        Ok(())
    }

    pub fn apply(&mut self, file: DaemonFileConfig) {
        if let Some(state_dir) = file.state_dir {
            // The database follows the state dir unless it is set explicitly.
            if self.db_path == self.state_dir.join("familiard.db") {
                self.db_path = state_dir.join("familiard.db");
            }
            self.state_dir = state_dir;
        }
        if let Some(db_path) = file.db_path {
            self.db_path = db_path;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(token) = file.auth_token {
            self.auth_token = Some(token);
        }
    }

    pub fn questions_dir(&self) -> PathBuf {
        self.state_dir.join("questions")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.state_dir.join("agents")
    }
}

/// `$XDG_DATA_HOME/familiard/<repo>` (falling back to `~/.local/share`).
fn default_state_dir(workspace_root: &Path) -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    let repo = workspace_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workspace");
    data_dir.join("familiard").join(repo)
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    project: Config,
    engine: Engine,
    recovery: Arc<RecoveryCoordinator>,
    agents: Arc<dyn AgentProvider>,
    task_source: Option<Arc<dyn TaskSource>>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a daemon using the repository's `.familiar/config`.
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let project = Config::for_workspace(&config.workspace_root)?;
        Self::with_project(config, project).await
    }

    /// Create a daemon with explicit project settings.
    pub async fn with_project(config: DaemonConfig, project: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);
        let bus = Arc::new(EventBus::new(Arc::clone(&storage)));

        let questions = Arc::new(QuestionStore::open(config.questions_dir())?);
        let records = ProcessRecordStore::open(config.records_dir())?;
        let agents: Arc<dyn AgentProvider> = Arc::new(ProcessProvider::new(
            ProcessProviderConfig::from_config(&project),
            Arc::clone(&questions),
            records.clone(),
        ));
        let worktrees = Arc::new(WorktreeManager::new(WorktreeSettings::from_config(
            &config.workspace_root,
            &project,
        )));
        let loader = Arc::new(Loader::new(
            project.grimoire_dir.clone(),
            project.spell_dir.clone(),
            Arc::new(BuiltinSet::embedded()),
        ));
        let task_source = match project.task_source_cmd.as_deref() {
            Some(cmd) => Some(Arc::new(CommandTaskSource::new(cmd)?) as Arc<dyn TaskSource>),
            None => None,
        };

        let engine = Engine::new(
            EngineDeps {
                storage,
                bus,
                agents: Arc::clone(&agents),
                worktrees,
                questions,
                loader,
                slots: Arc::new(AgentSlots::new(project.max_concurrent_agents)),
                task_source: task_source.clone(),
            },
            EngineSettings::from_config(&project),
        );
        let recovery = Arc::new(RecoveryCoordinator::new(engine.clone(), records));

        Ok(Self {
            config,
            project,
            engine,
            recovery,
            agents,
            task_source,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }

    /// HTTP router over this daemon's engine.
    pub fn router(&self) -> axum::Router {
        server::create_router(self.app_state())
    }

    fn app_state(&self) -> Arc<server::AppState> {
        Arc::new(server::AppState {
            engine: self.engine.clone(),
            recovery: Arc::clone(&self.recovery),
            auth_token: self.config.auth_token.clone(),
        })
    }

    /// Recover state from the previous run, start the background loops and serve the
    /// API until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            workspace = %self.config.workspace_root.display(),
            port = self.config.port,
            "familiard starting"
        );
        info!(database = %self.config.db_path.display(), "storage ready");
        info!(max_agents = self.project.max_concurrent_agents, "agent slots configured");
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }
        if !self.agents.is_available().await {
            warn!(agent_bin = %self.project.agent_bin.display(), "agent executable not found; agent steps will block");
        }

        let report = self.recovery.recover().await?;
        if !report.interrupted.is_empty() {
            info!(tasks = ?report.interrupted, "workflows interrupted by restart are blocked");
        }

        tokio::spawn(orphan_scan_loop(
            Arc::clone(&self.recovery),
            self.project.orphan_scan_interval,
            self.shutdown.child_token(),
        ));
        match (&self.task_source, self.project.auto_start) {
            (Some(source), true) => {
                tokio::spawn(auto_start_loop(
                    self.engine.clone(),
                    Arc::clone(source),
                    self.project.poll_interval,
                    self.shutdown.child_token(),
                ));
            }
            (None, true) => warn!("auto_start is set but no task_source_cmd is configured"),
            _ => {}
        }

        server::start_server(self.app_state(), self.config.port, self.shutdown.child_token())
            .await?;
        Ok(())
    }

    /// Stop serving, wind down workflow runs and terminate agents.
    pub async fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
        self.engine.shutdown(SHUTDOWN_TIMEOUT).await;
        self.agents.terminate_all("daemon shutdown").await;
        self.engine.deps().slots.close();
        info!("shutdown complete");
    }
}

/// Re-scan for orphaned worktrees every `interval`. The startup scan is done by recovery.
async fn orphan_scan_loop(
    recovery: Arc<RecoveryCoordinator>,
    interval: Duration,
    token: CancellationToken,
) {
    if interval.is_zero() {
        return;
    }
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = recovery.scan_orphans().await {
            warn!(error = %e, "periodic orphan scan failed");
        }
    }
}

/// Start the default grimoire for every ready task that has no workflow yet.
pub async fn start_ready_tasks(engine: &Engine, source: &dyn TaskSource) -> Vec<String> {
    let ready = match source.fetch_ready().await {
        Ok(ready) => ready,
        Err(e) => {
            warn!(error = %e, "failed to fetch ready tasks");
            return Vec::new();
        }
    };
    let mut started = Vec::new();
    for task in ready {
        if engine.get(&task.id).is_ok() {
            continue;
        }
        let task_id = task.id.clone();
        match engine.start(task, None).await {
            Ok(_) => {
                info!(task_id = %task_id, "auto-started workflow");
                started.push(task_id);
            }
            Err(e) if e.is_conflict() => {}
            Err(e) => error!(task_id = %task_id, error = %e, "failed to auto-start workflow"),
        }
    }
    started
}

async fn auto_start_loop(
    engine: Engine,
    source: Arc<dyn TaskSource>,
    interval: Duration,
    token: CancellationToken,
) {
    let interval = interval.max(Duration::from_secs(1));
    loop {
        start_ready_tasks(&engine, source.as_ref()).await;
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
