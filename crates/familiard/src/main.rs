//! familiard - workflow orchestration daemon.
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use familiard::{Daemon, DaemonConfig, DaemonFileConfig, DAEMON_CONFIG_FILE};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "familiard", about = "Workflow orchestration daemon for coding agents", version)]
struct Cli {
    /// Repository to orchestrate
    #[arg(long, env = "FAMILIARD_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    /// State directory (default: $XDG_DATA_HOME/familiard/<repo>)
    #[arg(long, env = "FAMILIARD_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// SQLite database path (default: <state dir>/familiard.db)
    #[arg(long, env = "FAMILIARD_DB")]
    db: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "FAMILIARD_PORT")]
    port: Option<u16>,

    /// Daemon settings file (default: <state dir>/familiard.toml)
    #[arg(long, env = "FAMILIARD_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    fn daemon_config(self) -> eyre::Result<DaemonConfig> {
        let workspace = self
            .workspace
            .canonicalize()
            .wrap_err_with(|| format!("workspace {} not found", self.workspace.display()))?;
        let mut config = DaemonConfig::for_workspace(&workspace);
        if let Some(state_dir) = &self.state_dir {
            config.apply(DaemonFileConfig {
                state_dir: Some(state_dir.clone()),
                ..DaemonFileConfig::default()
            });
        }

        let file = self
            .config
            .unwrap_or_else(|| config.state_dir.join(DAEMON_CONFIG_FILE));
        config.load_file(&file)?;

        // Flags win over the settings file.
        config.apply(DaemonFileConfig {
            state_dir: self.state_dir,
            db_path: self.db,
            port: self.port,
            auth_token: None,
        });
        Ok(config)
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli.daemon_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .wrap_err("failed to initialize daemon")?;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = &result {
                        error!(error = %e, "daemon error");
                    }
                    daemon.shutdown().await;
                    result?;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, initiating graceful shutdown");
                    daemon.shutdown().await;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating graceful shutdown");
                    daemon.shutdown().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = &result {
                        error!(error = %e, "daemon error");
                    }
                    daemon.shutdown().await;
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, initiating graceful shutdown");
                    daemon.shutdown().await;
                }
            }
        }

        Ok::<(), eyre::Report>(())
    })
}
