use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::{default_config_paths, load_config, AgentConfig};
use crate::control::{start_server, ControlError, ControlState};
use crate::manager::{read_pipeline_dir, ManagerError, PipelineManager};
use crate::plugin::PluginRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("pipeline manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("control server error: {0}")]
    Control(#[from] ControlError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(config_path) = config_path else {
        eprintln!("Error: no config file found. Looked in:");
        for candidate in default_config_paths() {
            eprintln!("  {}", candidate.display());
        }
        eprintln!("\nPass --config <path>, or create one with 'logferry config init'.");
        std::process::exit(1);
    };

    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(&config_path)?;
    Ok(run_agent(config).await?)
}

/// Run until Ctrl-C, then stop every pipeline with the exit flag set.
pub async fn run_agent(config: AgentConfig) -> Result<(), RunError> {
    info!(
        dir = %config.checkpoint.dir.display(),
        file = %config.checkpoint.file,
        "Opening checkpoint store"
    );
    let checkpoint = Arc::new(CheckpointStore::open_at(
        &config.checkpoint.dir,
        &config.checkpoint.file,
    )?);

    let manager = Arc::new(PipelineManager::from_config(
        PluginRegistry::with_builtins(),
        checkpoint.clone(),
        &config,
    ));

    match &config.pipelines.dir {
        Some(dir) => {
            let documents = read_pipeline_dir(dir)?;
            info!(dir = %dir.display(), count = documents.len(), "Loading pipelines");
            for (name, text) in documents {
                if let Err(e) = manager.load(&name, &text).await {
                    error!(pipeline = %name, error = %e, "failed to load pipeline");
                }
            }
        }
        None => warn!("No pipelines directory configured"),
    }
    manager.resume().await;
    info!(pipelines = ?manager.names().await, "Agent running");

    let shutdown = CancellationToken::new();
    let control = config.control.as_ref().map(|control| {
        let state = Arc::new(ControlState::new(manager.clone()));
        let listen = control.listen.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { start_server(&listen, state, shutdown).await })
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    manager.hold_on(true).await;
    shutdown.cancel();
    if let Some(control) = control {
        if let Err(e) = control.await? {
            warn!(error = %e, "Control server exited with error");
        }
    }
    checkpoint.close()?;
    info!("Shutdown complete");
    Ok(())
}
