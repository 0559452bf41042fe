//! The `drover pipeline` command: run the work-item daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drover_pipeline::agent::CliTextAgent;
use drover_pipeline::channel::memory::MemoryChannelApi;
use drover_pipeline::{Identity, Pipeline, PipelineConfig};

use crate::config::DroverConfig;

/// Run the pipeline daemon; returns the process exit code.
pub async fn run(agent_binary: Option<PathBuf>, root: Option<PathBuf>) -> i32 {
    let config = match DroverConfig::resolve(agent_binary) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "configuration error");
            return 1;
        }
    };

    let project_root = match root.map(Ok).unwrap_or_else(std::env::current_dir) {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!(error = %e, "cannot determine project root");
            return 1;
        }
    };

    // The orchestrator runs as a subprocess of this same binary.
    let orchestrator_argv = match std::env::current_exe() {
        Ok(exe) => vec![exe.to_string_lossy().into_owned(), "run".to_owned()],
        Err(e) => {
            tracing::error!(error = %e, "cannot locate own executable");
            return 1;
        }
    };

    let mut pipeline_config = PipelineConfig::new(&project_root, orchestrator_argv);
    pipeline_config.channel_prefix = config.pipeline.channel_prefix.clone();
    pipeline_config.max_verification_cycles = config.pipeline.max_verification_cycles;
    pipeline_config.poll_interval = Duration::from_secs(config.pipeline.poll_interval_secs);
    pipeline_config.validator_model = config.invoker.validator_model.clone();

    let identity = Identity::new(config.pipeline.display_name.clone());
    let agent = CliTextAgent::new(
        config.agent_command.clone(),
        &project_root,
        config.invoker.task_timeout,
    );

    // The concrete messaging backend is out of scope; the in-memory binding
    // keeps the daemon filesystem-driven until one is wired in.
    let channels = Arc::new(MemoryChannelApi::new());

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let mut pipeline = Pipeline::new(pipeline_config, identity, channels, Arc::new(agent));
    match pipeline.run(cancel).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "pipeline failed");
            1
        }
    }
}

/// Translate Ctrl-C / SIGTERM into cancellation so the daemon can sweep
/// before exiting.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}
