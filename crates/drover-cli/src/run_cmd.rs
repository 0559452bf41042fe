//! The `drover run` command: execute one plan.

use std::path::PathBuf;
use std::sync::Arc;

use drover_core::{
    AgentInvoker, LogNotifier, Orchestrator, OrchestratorOptions, OrchestratorResult,
};

use crate::config::DroverConfig;

/// Run the orchestrator; returns the process exit code.
pub async fn run(
    agent_binary: Option<PathBuf>,
    plan: PathBuf,
    options: OrchestratorOptions,
) -> i32 {
    let config = match DroverConfig::resolve(agent_binary) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "configuration error");
            return 1;
        }
    };

    let project_root = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!(error = %e, "cannot determine working directory");
            return 1;
        }
    };

    let invoker = AgentInvoker::new(config.agent_command, config.invoker);
    let mut orchestrator = Orchestrator::new(
        invoker,
        Arc::new(LogNotifier),
        project_root,
        config.breaker,
        options,
    );

    match orchestrator.run(&plan).await {
        Ok(result) => {
            report(&result, &orchestrator);
            result.exit_code()
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "orchestrator failed");
            1
        }
    }
}

fn report(result: &OrchestratorResult, orchestrator: &Orchestrator) {
    match result {
        OrchestratorResult::Completed => {
            println!("plan completed ({})", orchestrator.usage());
        }
        OrchestratorResult::SingleTaskDone => {
            println!("tick finished ({})", orchestrator.usage());
        }
        OrchestratorResult::Deadlocked { blocked } => {
            eprintln!("plan deadlocked; stuck tasks: {}", blocked.join(", "));
        }
        OrchestratorResult::Stopped => {
            println!("stopped by semaphore");
        }
        OrchestratorResult::BreakerOpen => {
            eprintln!("circuit breaker open, giving up");
        }
    }
}
