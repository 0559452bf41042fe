//! Parallel batch execution: worktree isolation, disjointness enforcement,
//! and copy-back merging.

use std::sync::Arc;
use std::time::Duration;

use drover_core::breaker::CircuitBreaker;
use drover_core::invoker::{AgentCommand, AgentInvoker, InvokerConfig};
use drover_core::notify::LogNotifier;
use drover_core::plan::{PlanFile, TaskStatus};
use drover_core::{Orchestrator, OrchestratorOptions, OrchestratorResult};
use drover_test_utils::{plan_toml, FakeAgent, TaskSpec, TestRepo};

fn worktree_base(repo: &TestRepo) -> std::path::PathBuf {
    let name = repo.root().file_name().unwrap().to_string_lossy().into_owned();
    repo.root().parent().unwrap().join(format!("{name}-drover-worktrees"))
}

async fn run_parallel(repo: &TestRepo, agent: &FakeAgent, plan: &str) -> OrchestratorResult {
    let agent_path = agent.install(repo.root());
    let plan_path = repo.write("plan.toml", plan);
    repo.commit_all("add plan");

    let invoker = AgentInvoker::new(
        AgentCommand::direct(&agent_path),
        InvokerConfig {
            task_timeout: Duration::from_secs(20),
            roles_dir: repo.root().join("roles"),
            suppress_prompts: true,
            validator_model: "validator-test".to_owned(),
        },
    );
    let mut orchestrator = Orchestrator::new(
        invoker,
        Arc::new(LogNotifier),
        repo.root().to_path_buf(),
        CircuitBreaker::new(10, Duration::from_millis(10)),
        OrchestratorOptions {
            parallel: true,
            ..OrchestratorOptions::default()
        },
    );
    orchestrator.run(&plan_path).await.expect("run should not error")
}

fn parallel_pair(a: TaskSpec, b: TaskSpec) -> String {
    plan_toml("batch", 3, &[a, b])
}

#[tokio::test]
async fn disjoint_group_runs_in_worktrees_and_merges_back() {
    let repo = TestRepo::new();
    let plan = parallel_pair(
        TaskSpec {
            parallel_group: Some("g"),
            description: "produce the alpha artifact",
            ..TaskSpec::new("2.1")
        },
        TaskSpec {
            parallel_group: Some("g"),
            description: "produce the beta artifact",
            ..TaskSpec::new("2.2")
        },
    );
    let agent = FakeAgent {
        touch_task_file: true,
        ..FakeAgent::default()
    };

    let result = run_parallel(&repo, &agent, &plan).await;
    assert_eq!(result, OrchestratorResult::Completed);

    // Both agents ran in isolation; their outputs were copied back.
    assert_eq!(repo.read("out-2.1.txt").trim(), "made by 2.1");
    assert_eq!(repo.read("out-2.2.txt").trim(), "made by 2.2");

    // Worktrees were used and then removed.
    let base = worktree_base(&repo);
    assert!(base.exists(), "worktree base was created");
    let leftovers: Vec<_> = std::fs::read_dir(&base)
        .map(|entries| entries.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "worktrees were removed: {leftovers:?}");

    // Copy-back commits are per task and orchestrator-authored.
    let subjects = repo.log_subjects();
    assert!(subjects.iter().any(|s| s.contains("task 2.1 (parallel batch)")));
    assert!(subjects.iter().any(|s| s.contains("task 2.2 (parallel batch)")));

    let file = PlanFile::load(repo.root().join("plan.toml")).unwrap();
    assert_eq!(file.task("2.1").unwrap().status, TaskStatus::Completed);
    assert_eq!(file.task("2.2").unwrap().status, TaskStatus::Completed);
}

// S4: a shared exclusive resource forces sequential execution.
#[tokio::test]
async fn shared_resource_falls_back_to_sequential() {
    let repo = TestRepo::new();
    let plan = parallel_pair(
        TaskSpec {
            parallel_group: Some("g"),
            exclusive_resources: &["db"],
            description: "migrate the alpha tables",
            ..TaskSpec::new("2.1")
        },
        TaskSpec {
            parallel_group: Some("g"),
            exclusive_resources: &["db"],
            description: "migrate the beta tables",
            ..TaskSpec::new("2.2")
        },
    );

    let result = run_parallel(&repo, &FakeAgent::default(), &plan).await;
    assert_eq!(result, OrchestratorResult::Completed);

    // No worktree was ever created for the conflicting pair.
    assert!(!worktree_base(&repo).exists(), "sequential fallback avoids worktrees");

    let file = PlanFile::load(repo.root().join("plan.toml")).unwrap();
    assert_eq!(file.task("2.1").unwrap().status, TaskStatus::Completed);
    assert_eq!(file.task("2.2").unwrap().status, TaskStatus::Completed);
}

// File-path overlap in descriptions is a conflict too.
#[tokio::test]
async fn file_overlap_falls_back_to_sequential() {
    let repo = TestRepo::new();
    let plan = parallel_pair(
        TaskSpec {
            parallel_group: Some("g"),
            description: "edit src/shared.rs for alpha",
            ..TaskSpec::new("2.1")
        },
        TaskSpec {
            parallel_group: Some("g"),
            description: "edit src/shared.rs for beta",
            ..TaskSpec::new("2.2")
        },
    );

    let result = run_parallel(&repo, &FakeAgent::default(), &plan).await;
    assert_eq!(result, OrchestratorResult::Completed);
    assert!(!worktree_base(&repo).exists());
}
