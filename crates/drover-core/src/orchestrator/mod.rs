//! The plan orchestrator: runs a plan to completion by spawning agents in
//! dependency order, one scheduler tick at a time.
//!
//! The loop is single-threaded; parallelism comes from concurrently awaited
//! agent subprocesses, each isolated in its own worktree, joined before the
//! next tick. All cross-process state lives in files: the plan document,
//! the completion records, and the stop semaphore.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::breaker::CircuitBreaker;
use crate::git;
use crate::invoker::{
    self, plan_prefix, AgentInvoker, AgentOutcome, Invocation, PermissionProfile,
};
use crate::notify::Notifier;
use crate::plan::{PlanFile, PlanStatus, TaskStatus};
use crate::scheduler::{self, SchedulerVerdict};
use crate::stash;
use crate::stop::StopSemaphore;
use crate::usage::{PlanUsage, UsageSample};
use crate::worktree::WorktreeManager;

/// CLI-facing execution options.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Enable parallel batches (worktree isolation).
    pub parallel: bool,
    /// Report what would run next without spawning anything.
    pub dry_run: bool,
    /// Run exactly one scheduler tick, then exit.
    pub single_task: bool,
    /// Skip (mark `skipped`) every pending task before this id.
    pub resume_from: Option<String>,
    /// Skip the startup environment checks.
    pub skip_smoke: bool,
}

/// Terminal outcome of an orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorResult {
    /// Every task reached a terminal-success state.
    Completed,
    /// One scheduler tick ran under `--single-task`; the plan may have work
    /// left.
    SingleTaskDone,
    /// The dependency graph can make no further progress.
    Deadlocked { blocked: Vec<String> },
    /// The stop semaphore was observed before selecting a new task.
    Stopped,
    /// The circuit breaker opened twice without an intervening success.
    BreakerOpen,
}

impl OrchestratorResult {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed | Self::SingleTaskDone => 0,
            Self::Deadlocked { .. } => 1,
            Self::Stopped => 2,
            Self::BreakerOpen => 3,
        }
    }
}

/// Drives one plan from its current state to a terminal outcome.
pub struct Orchestrator {
    invoker: AgentInvoker,
    notifier: Arc<dyn Notifier>,
    project_root: PathBuf,
    breaker: CircuitBreaker,
    options: OrchestratorOptions,
    usage: PlanUsage,
}

impl Orchestrator {
    pub fn new(
        invoker: AgentInvoker,
        notifier: Arc<dyn Notifier>,
        project_root: impl Into<PathBuf>,
        breaker: CircuitBreaker,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            invoker,
            notifier,
            project_root: project_root.into(),
            breaker,
            options,
            usage: PlanUsage::default(),
        }
    }

    /// Usage accumulated so far (per plan run).
    pub fn usage(&self) -> &PlanUsage {
        &self.usage
    }

    /// Run the plan at `plan_path` to a terminal outcome.
    pub async fn run(&mut self, plan_path: &Path) -> Result<OrchestratorResult> {
        let prefix = plan_prefix(plan_path);
        let mut file = PlanFile::load(plan_path)?;

        let semaphore = StopSemaphore::for_plan(plan_path);
        semaphore
            .clear_stale()
            .context("failed to clear stale stop semaphore")?;

        if !self.options.skip_smoke {
            self.smoke_check(&file)?;
        }

        if let Some(resume_id) = self.options.resume_from.clone() {
            skip_before(&mut file, &resume_id)?;
        }

        if file.plan().meta.status == PlanStatus::Pending {
            file.set_plan_status(PlanStatus::InProgress);
        }
        file.save()?;

        // Pathspec for the stash exclusion, relative to the repository root.
        let plan_rel = plan_rel_path(plan_path, &self.project_root);
        let completion_rel = format!(
            "{}/{}",
            invoker::completion::RECORD_DIR,
            invoker::completion::RECORD_FILE
        );

        loop {
            if semaphore.is_set() {
                tracing::info!(plan = %prefix, "stop semaphore present, exiting before next task");
                return Ok(OrchestratorResult::Stopped);
            }

            if self.breaker.is_open() {
                if self.breaker.exhausted() {
                    tracing::error!(plan = %prefix, "circuit breaker reopened, giving up");
                    return Ok(OrchestratorResult::BreakerOpen);
                }
                let wait = self.breaker.remaining_cooldown().unwrap_or_default();
                tracing::warn!(
                    plan = %prefix,
                    cooldown_secs = wait.as_secs(),
                    "circuit breaker open, cooling down"
                );
                tokio::time::sleep(wait).await;
                self.breaker.end_cooldown();
            }

            match scheduler::assess(file.plan(), self.options.parallel) {
                SchedulerVerdict::AllDone => {
                    file.set_plan_status(PlanStatus::Completed);
                    file.save()?;
                    tracing::info!(plan = %prefix, usage = %self.usage, "plan completed");
                    return Ok(OrchestratorResult::Completed);
                }
                SchedulerVerdict::Deadlock { blocked } => {
                    file.set_plan_status(PlanStatus::Failed);
                    file.save()?;
                    let body = format!(
                        "plan {} is deadlocked; stuck tasks: {}",
                        file.plan().meta.name,
                        blocked.join(", ")
                    );
                    tracing::error!(plan = %prefix, blocked = ?blocked, "plan deadlocked");
                    if let Err(e) = self.notifier.notify("plan deadlocked", &body).await {
                        tracing::warn!(error = %e, "failed to send deadlock notification");
                    }
                    return Ok(OrchestratorResult::Deadlocked { blocked });
                }
                SchedulerVerdict::Run(batch) => {
                    if self.options.dry_run {
                        tracing::info!(plan = %prefix, tasks = ?batch, "dry run: would run");
                        return Ok(OrchestratorResult::SingleTaskDone);
                    }
                    if batch.len() == 1 {
                        self.run_sequential(&mut file, &batch[0], &prefix, &plan_rel, &completion_rel)
                            .await?;
                    } else {
                        self.run_parallel_batch(&mut file, &batch, &prefix, &plan_rel, &completion_rel)
                            .await?;
                    }
                    if self.options.single_task {
                        tracing::info!(plan = %prefix, "single-task mode, exiting after one tick");
                        return Ok(OrchestratorResult::SingleTaskDone);
                    }
                }
            }
        }
    }

    /// Startup checks that turn misconfiguration into an immediate error
    /// instead of a mid-plan surprise.
    fn smoke_check(&self, file: &PlanFile) -> Result<()> {
        git::ensure_repo(&self.project_root).context("project root is not a git repository")?;
        for task in file.plan().tasks() {
            if let Some(role) = task.agent.as_deref() {
                invoker::prompt::load_role_preamble(&self.invoker.config().roles_dir, role)
                    .with_context(|| {
                        format!("task {} names unknown agent role {role:?}", task.id)
                    })?;
            }
        }
        Ok(())
    }

    /// Run one task in the primary working copy, wrapped in the stash.
    async fn run_sequential(
        &mut self,
        file: &mut PlanFile,
        task_id: &str,
        prefix: &str,
        plan_rel: &str,
        completion_rel: &str,
    ) -> Result<()> {
        let stashed = stash::push(&self.project_root, plan_rel)?;

        let attempt = file.begin_attempt(task_id)?;
        file.save()?;

        // Snapshot the plan for the invocation so the live document can be
        // mutated afterwards.
        let plan_snapshot = file.plan().clone();
        let task_snapshot = plan_snapshot
            .find_task(task_id)
            .expect("task id came from the scheduler")
            .clone();
        let model = plan_snapshot
            .effective_model(&task_snapshot, attempt)
            .map(str::to_owned);
        if let Some(m) = &model {
            tracing::info!(task_id, attempt, model = %m, "effective model for attempt");
        }

        let outcome = self
            .invoker
            .run(&Invocation {
                plan: &plan_snapshot,
                task: &task_snapshot,
                attempt,
                workdir: &self.project_root,
                plan_prefix: prefix,
                model,
                profile: PermissionProfile::for_role(task_snapshot.agent.as_deref()),
            })
            .await;

        let status_word = self.apply_outcome(file, task_id, outcome).await?;
        file.save()?;

        // The completion record is transient; it never belongs in a commit.
        invoker::completion::clear(&self.project_root)
            .context("failed to clear completion record after task")?;

        git::commit_all(
            &self.project_root,
            &format!("drover: task {task_id} {status_word} (attempt {attempt})"),
        )?;

        if stashed {
            let restored = stash::pop(&self.project_root, completion_rel)?;
            tracing::debug!(task_id, outcome = ?restored, "restored pre-task stash");
        }
        Ok(())
    }

    /// Run a parallel batch, one worktree per task.
    async fn run_parallel_batch(
        &mut self,
        file: &mut PlanFile,
        task_ids: &[String],
        prefix: &str,
        plan_rel: &str,
        completion_rel: &str,
    ) -> Result<()> {
        let manager = WorktreeManager::new(&self.project_root, None)?;
        let plan_slug = slugify(&file.plan().meta.name);

        let stashed = stash::push(&self.project_root, plan_rel)?;

        // Mark every batch member in_progress before any agent spawns.
        let mut attempts = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            attempts.push(file.begin_attempt(id)?);
        }
        file.save()?;

        let mut handles = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            let branch = WorktreeManager::branch_name(&plan_slug, id);
            let handle = manager.create(&branch)?;
            // A worktree checkout can inherit a committed completion record.
            invoker::completion::clear(&handle.path)
                .context("failed to clear inherited completion record")?;
            handles.push(handle);
        }

        let plan_snapshot = file.plan().clone();
        let invocations: Vec<Invocation<'_>> = task_ids
            .iter()
            .zip(&handles)
            .zip(&attempts)
            .map(|((id, handle), attempt)| {
                let task = plan_snapshot
                    .find_task(id)
                    .expect("task id came from the scheduler");
                let model = plan_snapshot.effective_model(task, *attempt).map(str::to_owned);
                Invocation {
                    plan: &plan_snapshot,
                    task,
                    attempt: *attempt,
                    workdir: &handle.path,
                    plan_prefix: prefix,
                    model,
                    profile: PermissionProfile::for_role(task.agent.as_deref()),
                }
            })
            .collect();
        let results =
            futures::future::join_all(invocations.iter().map(|inv| self.invoker.run(inv))).await;

        for ((id, handle), result) in task_ids.iter().zip(&handles).zip(results) {
            let succeeded = matches!(
                &result,
                Ok(r) if r.outcome == AgentOutcome::Completed
            );
            if succeeded {
                let copied = manager.copy_back(handle, plan_rel)?;
                if !copied.is_empty() {
                    let refs: Vec<&str> = copied.iter().map(String::as_str).collect();
                    git::add_paths(&self.project_root, &refs)?;
                    git::commit_staged(
                        &self.project_root,
                        &format!("drover: task {id} (parallel batch)"),
                    )?;
                }
            }
            self.apply_outcome(file, id, result).await?;
            // Persist each member's outcome immediately so a reload
            // triggered by a later member cannot shed it.
            file.save()?;
            manager.remove(handle)?;
        }
        manager.prune()?;

        file.save()?;
        git::commit_all(&self.project_root, "drover: update plan after parallel batch")?;

        if stashed {
            stash::pop(&self.project_root, completion_rel)?;
        }
        Ok(())
    }

    /// Translate one invocation result into plan mutations, breaker and
    /// usage updates, and notifications. Returns a word for commit messages.
    async fn apply_outcome(
        &mut self,
        file: &mut PlanFile,
        task_id: &str,
        outcome: Result<invoker::InvocationResult>,
    ) -> Result<&'static str> {
        match outcome {
            Err(e) => {
                tracing::error!(task_id, error = %format!("{e:#}"), "agent invocation failed");
                let next = file.record_failure(task_id, &format!("agent invocation error: {e:#}"))?;
                self.breaker.record_failure();
                self.usage.record(task_id, UsageSample::default());
                Ok(if next == TaskStatus::Failed { "failed" } else { "retrying" })
            }
            Ok(result) => {
                if result.plan_modified {
                    tracing::info!(task_id, "agent modified the plan, reloading");
                    file.reload()?;
                }
                self.usage.record(task_id, result.usage);
                match result.outcome {
                    AgentOutcome::Completed => {
                        file.record_success(task_id, &result.message)?;
                        self.breaker.record_success();
                        Ok("completed")
                    }
                    AgentOutcome::Failed => {
                        let next = file.record_failure(task_id, &result.message)?;
                        self.breaker.record_failure();
                        Ok(if next == TaskStatus::Failed { "failed" } else { "retrying" })
                    }
                    AgentOutcome::Suspended => {
                        let question = result
                            .question
                            .as_ref()
                            .map(|q| q.text.clone())
                            .unwrap_or_else(|| result.message.clone());
                        file.record_suspension(task_id, &question)?;
                        let body = match &result.question {
                            Some(q) if !q.context.is_empty() => {
                                format!("task {task_id} asks: {}\n\ncontext: {}", q.text, q.context)
                            }
                            _ => format!("task {task_id} asks: {question}"),
                        };
                        if let Err(e) = self.notifier.notify("task suspended", &body).await {
                            tracing::warn!(task_id, error = %e, "failed to send suspension notification");
                        }
                        Ok("suspended")
                    }
                }
            }
        }
    }
}

/// Mark every pending task strictly before `resume_id` (document order) as
/// skipped.
fn skip_before(file: &mut PlanFile, resume_id: &str) -> Result<()> {
    let ids: Vec<String> = file.plan().tasks().map(|t| t.id.clone()).collect();
    let cut = ids
        .iter()
        .position(|id| id == resume_id)
        .with_context(|| format!("--resume-from names unknown task {resume_id:?}"))?;

    for id in &ids[..cut] {
        if file.task(id)?.status == TaskStatus::Pending {
            file.set_task_status(id, TaskStatus::Skipped)?;
            tracing::info!(task_id = %id, "skipped by --resume-from");
        }
    }
    Ok(())
}

/// Plan path relative to the repository root, for stash pathspecs.
fn plan_rel_path(plan_path: &Path, project_root: &Path) -> String {
    let canonical_plan = plan_path.canonicalize().unwrap_or_else(|_| plan_path.to_path_buf());
    let canonical_root = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    canonical_plan
        .strip_prefix(&canonical_root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| {
            plan_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| plan_path.display().to_string())
        })
}

/// File-system-safe slug for worktree branch names.
fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(OrchestratorResult::Completed.exit_code(), 0);
        assert_eq!(OrchestratorResult::SingleTaskDone.exit_code(), 0);
        assert_eq!(OrchestratorResult::Deadlocked { blocked: vec![] }.exit_code(), 1);
        assert_eq!(OrchestratorResult::Stopped.exit_code(), 2);
        assert_eq!(OrchestratorResult::BreakerOpen.exit_code(), 3);
    }

    #[test]
    fn slugify_flattens_names() {
        assert_eq!(slugify("Fix the NULL deref!"), "fix-the-null-deref");
        assert_eq!(slugify("already-slugged"), "already-slugged");
    }
}
