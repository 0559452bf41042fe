mod config;
mod pipeline_cmd;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drover", about = "Autonomous multi-agent task orchestrator")]
struct Cli {
    /// Path to the agent binary (overrides DROVER_AGENT_BINARY and config)
    #[arg(long, global = true)]
    agent_binary: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan to completion
    Run {
        /// Path to the plan document
        plan: PathBuf,
        /// Report what would run next without spawning agents
        #[arg(long)]
        dry_run: bool,
        /// Run exactly one task, then exit
        #[arg(long)]
        single_task: bool,
        /// Skip pending tasks before this task id
        #[arg(long)]
        resume_from: Option<String>,
        /// Run parallel-group batches concurrently in worktrees
        #[arg(long)]
        parallel: bool,
        /// Skip the startup environment checks
        #[arg(long)]
        skip_smoke: bool,
    },
    /// Run the work-item pipeline daemon
    Pipeline {
        /// Project root (defaults to the current directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Show plan and task status
    Status {
        /// Path to the plan document
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let exit_code = match cli.command {
        Commands::Run {
            plan,
            dry_run,
            single_task,
            resume_from,
            parallel,
            skip_smoke,
        } => {
            run_cmd::run(
                cli.agent_binary,
                plan,
                drover_core::OrchestratorOptions {
                    parallel,
                    dry_run,
                    single_task,
                    resume_from,
                    skip_smoke,
                },
            )
            .await
        }
        Commands::Pipeline { root } => pipeline_cmd::run(cli.agent_binary, root).await,
        Commands::Status { plan } => status_cmd::run(&plan),
    };

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "drover",
            "run",
            "plans/demo.toml",
            "--parallel",
            "--resume-from",
            "2.1",
            "--skip-smoke",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                plan,
                parallel,
                resume_from,
                skip_smoke,
                dry_run,
                single_task,
            } => {
                assert_eq!(plan, PathBuf::from("plans/demo.toml"));
                assert!(parallel);
                assert!(skip_smoke);
                assert!(!dry_run);
                assert!(!single_task);
                assert_eq!(resume_from.as_deref(), Some("2.1"));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn agent_binary_flag_is_global() {
        let cli = Cli::try_parse_from([
            "drover",
            "status",
            "plan.toml",
            "--agent-binary",
            "/usr/local/bin/claude",
        ])
        .unwrap();
        assert_eq!(cli.agent_binary, Some(PathBuf::from("/usr/local/bin/claude")));
    }
}
