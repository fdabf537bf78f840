//! loomd — the control-plane daemon.
//!
//! Exit codes: 0 on clean shutdown, 1 for configuration errors, 2 for
//! runtime errors.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use loom_core::config::Config;
use loom_daemon::lockfile::DaemonLockfile;
use loom_daemon::orchestrator::Loom;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Returns the config and whether it came from a file (as opposed to
/// built-in defaults when no file exists).
fn load_config() -> Result<(Config, Option<PathBuf>)> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("loom.toml"));
    if path.exists() {
        let config =
            Config::load_from(&path).with_context(|| format!("loading {}", path.display()))?;
        Ok((config, Some(path)))
    } else {
        Ok((Config::default(), None))
    }
}

async fn run(config: Config) -> Result<()> {
    let lock_path = DaemonLockfile::path_in(&config.general.base_dir);
    std::fs::create_dir_all(&config.general.base_dir)
        .with_context(|| format!("creating {}", config.general.base_dir.display()))?;
    DaemonLockfile::for_current_process(&config.general.base_dir)
        .acquire_or_fail(&lock_path)
        .map_err(anyhow::Error::msg)?;

    let result = async {
        let loom = Loom::new(config).await?;
        loom.initialize().await?;
        info!(pid = std::process::id(), "loomd running");

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutdown signal received");
        loom.shutdown().await;
        Ok(())
    }
    .await;

    DaemonLockfile::remove(&lock_path);
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let (config, config_path) = match load_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.clone())),
        )
        .init();
    match &config_path {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => warn!("no configuration file, using defaults"),
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "daemon failed");
            ExitCode::from(2)
        }
    }
}
