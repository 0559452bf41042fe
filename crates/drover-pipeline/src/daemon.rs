//! The pipeline daemon: work-item lifecycle engine.
//!
//! One loop drives everything: poll channels and route messages, scan the
//! backlog, and push the first ready item through plan-create -> execute ->
//! verify -> archive. The orchestrator runs as a subprocess; all shared
//! state lives in files, so a kill at any point is recoverable (the startup
//! sweep handles the one non-atomic gap).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use drover_core::plan::{PlanFile, PlanStatus, TaskStatus};

use crate::agent::TextAgent;
use crate::archive::Archiver;
use crate::channel::{
    route, ChannelApi, ChannelRole, ChannelSet, ControlVerb, Identity, InboundAction,
};
use crate::intake;
use crate::layout::Layout;
use crate::plan_create;
use crate::scanner;
use crate::sweep;
use crate::verify::{self, Verdict};
use crate::workitem::{WorkItem, WorkItemKind, WorkItemStatus};

/// Daemon configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub project_root: PathBuf,
    /// Channel discovery prefix (e.g. the project name).
    pub channel_prefix: String,
    /// Bound on execute -> verify -> retry cycles per defect.
    pub max_verification_cycles: u32,
    /// Base delay between daemon ticks.
    pub poll_interval: Duration,
    /// Command line that launches the orchestrator; the plan path is
    /// appended. Usually `[current_exe, "run"]`.
    pub orchestrator_argv: Vec<String>,
    /// Fixed model for verification agents.
    pub validator_model: String,
}

impl PipelineConfig {
    pub fn new(project_root: impl Into<PathBuf>, orchestrator_argv: Vec<String>) -> Self {
        Self {
            project_root: project_root.into(),
            channel_prefix: "drover".to_owned(),
            max_verification_cycles: 3,
            poll_interval: Duration::from_secs(30),
            orchestrator_argv,
            validator_model: "validator-default".to_owned(),
        }
    }
}

/// What processing one work item concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Executed (and for defects, verified) successfully; archived.
    Completed,
    /// Verification failed `max_verification_cycles` times; archived as
    /// failed.
    VerificationExhausted,
    /// The plan deadlocked; the item stays in the backlog for an operator.
    PlanFailed,
    /// Plan already marked failed from an earlier run; hard skip.
    SkippedFailedPlan,
}

/// The pipeline daemon.
pub struct Pipeline {
    layout: Layout,
    config: PipelineConfig,
    identity: Identity,
    channels: Arc<dyn ChannelApi>,
    agent: Arc<dyn TextAgent>,
    archiver: Archiver,
    paused: bool,
    /// Notifications channel id, once discovery has found one.
    notifications_channel: Option<String>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        identity: Identity,
        channels: Arc<dyn ChannelApi>,
        agent: Arc<dyn TextAgent>,
    ) -> Self {
        let layout = Layout::new(&config.project_root);
        let archiver = Archiver::new(layout.clone());
        Self {
            layout,
            config,
            identity,
            channels,
            agent,
            archiver,
            paused: false,
            notifications_channel: None,
        }
    }

    /// Run the daemon until cancelled or told to stop.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.layout.ensure_dirs()?;
        sweep::startup_sweep(&self.layout)?;

        let channel_set = ChannelSet::discover(self.channels.as_ref(), &self.config.channel_prefix)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "channel discovery failed, running without channels");
                ChannelSet::default()
            });
        self.notifications_channel = channel_set
            .get(ChannelRole::Notifications)
            .map(|ch| ch.id.clone());

        loop {
            if cancel.is_cancelled() {
                tracing::info!("pipeline cancelled, sweeping before exit");
                sweep::sweep_best_effort(&self.layout);
                return Ok(());
            }

            let stop = match self.poll_channels(&channel_set).await {
                Ok(stop) => stop,
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), "channel polling failed");
                    false
                }
            };
            if stop {
                tracing::info!("stop verb received, sweeping and exiting");
                sweep::sweep_best_effort(&self.layout);
                return Ok(());
            }

            if !self.paused {
                if let Err(e) = self.tick().await {
                    tracing::error!(error = %format!("{e:#}"), "pipeline tick failed");
                }
            }

            // Jittered sleep so multiple pipelines don't herd on a backend.
            let quarter = self.config.poll_interval / 4;
            let jitter = if quarter.is_zero() {
                Duration::ZERO
            } else {
                rand::rng().random_range(Duration::ZERO..quarter)
            };
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(self.config.poll_interval + jitter) => {}
            }
        }
    }

    /// One scan-and-process pass.
    pub async fn tick(&mut self) -> Result<()> {
        let outcome = scanner::scan(&self.layout)?;

        for stray in &outcome.strays {
            self.archiver.archive(stray)?;
        }

        if let Some(item) = outcome.candidates.into_iter().next() {
            let slug = item.slug.clone();
            let concluded = self.process_item(item).await?;
            tracing::info!(slug = %slug, outcome = ?concluded, "work item processed");
        }
        Ok(())
    }

    /// Push one work item through its lifecycle.
    pub async fn process_item(&mut self, mut item: WorkItem) -> Result<ItemOutcome> {
        let plan_path = self.layout.plan_path(&item.slug);

        // A plan that already deadlocked is a hard skip; the orchestrator is
        // never re-invoked on it.
        if plan_path.exists() {
            if let Ok(existing) = PlanFile::load(&plan_path) {
                if existing.plan().meta.status == PlanStatus::Failed {
                    tracing::debug!(slug = %item.slug, "plan previously failed, skipping item");
                    return Ok(ItemOutcome::SkippedFailedPlan);
                }
            }
        }

        loop {
            // Prior verification sections count toward the bound, so a
            // restart cannot reset the cycle count.
            let cycles = item.verification_count();
            if cycles >= self.config.max_verification_cycles {
                return self.give_up(&mut item, &plan_path);
            }

            if !plan_path.exists() {
                plan_create::create_plan(self.agent.as_ref(), &self.layout, &item)
                    .await
                    .context("plan creation failed")?;
            }

            let status = self.run_orchestrator(&plan_path).await?;
            if !status.success() {
                tracing::warn!(
                    slug = %item.slug,
                    code = status.code().unwrap_or(-1),
                    "orchestrator exited non-zero, leaving item for an operator"
                );
                self.notify(&format!(
                    "plan for {} failed (orchestrator exit {})",
                    item.slug,
                    status.code().unwrap_or(-1)
                ))
                .await;
                return Ok(ItemOutcome::PlanFailed);
            }

            // Only defects get symptom verification.
            if item.kind != WorkItemKind::Defect {
                item.rewrite_status(WorkItemStatus::Completed)?;
                self.archiver.archive(&item)?;
                return Ok(ItemOutcome::Completed);
            }

            let report = verify::run_verification(
                self.agent.as_ref(),
                &item,
                &self.config.validator_model,
            )
            .await?;
            let n = item.append_verification(&report.verdict.to_string(), &report.findings)?;
            tracing::info!(slug = %item.slug, cycle = n, verdict = %report.verdict, "verification recorded");

            if report.verdict.accepts() {
                if report.verdict == Verdict::Warn {
                    self.notify(&format!(
                        "{} verified with warnings: {}",
                        item.slug, report.findings
                    ))
                    .await;
                }
                item.rewrite_status(WorkItemStatus::Fixed)?;
                self.archiver.archive(&item)?;
                return Ok(ItemOutcome::Completed);
            }

            // FAIL: drop the plan so the next cycle regenerates it with the
            // findings now part of the item text.
            self.remove_plan(&plan_path, &item.slug)?;
        }
    }

    /// Verification cycles exhausted: archive the item as failed, with no
    /// orphan plan left behind.
    fn give_up(&mut self, item: &mut WorkItem, plan_path: &PathBuf) -> Result<ItemOutcome> {
        tracing::warn!(
            slug = %item.slug,
            cycles = self.config.max_verification_cycles,
            "verification cycles exhausted, archiving as failed"
        );
        item.rewrite_status(WorkItemStatus::Archived("verification failed".to_owned()))?;
        self.archiver.archive(item)?;
        self.remove_plan(plan_path, &item.slug)?;
        Ok(ItemOutcome::VerificationExhausted)
    }

    fn remove_plan(&self, plan_path: &PathBuf, slug: &str) -> Result<()> {
        if !plan_path.exists() {
            return Ok(());
        }
        std::fs::remove_file(plan_path)
            .with_context(|| format!("failed to remove plan {}", plan_path.display()))?;
        let rel = format!("plans/{slug}.toml");
        if let Err(e) = drover_core::git::add_paths(&self.config.project_root, &[rel.as_str()])
            .and_then(|()| {
                drover_core::git::commit_staged(
                    &self.config.project_root,
                    &format!("drop plan for {slug}"),
                )
                .map(|_| ())
            })
        {
            tracing::debug!(slug, error = %e, "plan removal not committed");
        }
        Ok(())
    }

    /// Invoke the orchestrator as a subprocess on a plan file.
    async fn run_orchestrator(&self, plan_path: &PathBuf) -> Result<std::process::ExitStatus> {
        let (program, rest) = self
            .config
            .orchestrator_argv
            .split_first()
            .context("orchestrator_argv is empty")?;

        tracing::info!(plan = %plan_path.display(), "invoking orchestrator");
        let status = tokio::process::Command::new(program)
            .args(rest)
            .arg(plan_path)
            .current_dir(&self.config.project_root)
            .kill_on_drop(true)
            .status()
            .await
            .context("failed to spawn orchestrator subprocess")?;
        Ok(status)
    }

    /// Poll every discovered channel and act on routed messages. Returns
    /// `true` when a stop verb was received.
    pub async fn poll_channels(&mut self, set: &ChannelSet) -> Result<bool> {
        let mut stop = false;
        for (role, channel) in set.iter() {
            let cursor = self.channels.load_cursor(&channel.id).await?;
            let messages = self.channels.poll(&channel.id, cursor.as_deref()).await?;
            let Some(last_ts) = messages.last().map(|m| m.ts.clone()) else {
                continue;
            };

            for message in &messages {
                match route(role, message, &self.identity) {
                    InboundAction::NewWorkItem { kind, text } => {
                        match intake::analyze(self.agent.as_ref(), &text).await {
                            Ok(result) => {
                                intake::write_work_item(&self.layout, &result, &text, kind)?;
                            }
                            Err(e) => {
                                tracing::warn!(error = %format!("{e:#}"), "intake analysis failed");
                            }
                        }
                    }
                    InboundAction::Control(ControlVerb::Stop) => stop = true,
                    InboundAction::Control(ControlVerb::Pause) => {
                        tracing::info!("pause verb received");
                        self.paused = true;
                    }
                    InboundAction::Control(ControlVerb::Status) => {
                        let summary = self.status_summary()?;
                        let signed = self.identity.sign(&summary);
                        self.channels.post(&channel.id, &signed).await?;
                    }
                    InboundAction::Question { text } => {
                        if !self.try_resume_from_answer(&text)? {
                            self.answer_question(&channel.id, &text).await?;
                        }
                    }
                    InboundAction::Ignore => {}
                }
            }

            self.channels.save_cursor(&channel.id, &last_ts).await?;
        }
        Ok(stop)
    }

    /// Treat a questions-channel message shaped like
    /// `answer <slug> <task-id>: <text>` as the out-of-band answer to a
    /// suspended task: the answer is appended to the task description and
    /// the task returns to `pending`. Returns `false` when the message is
    /// not an answer (or does not correlate), so it can be handled as an
    /// ordinary question instead.
    fn try_resume_from_answer(&self, text: &str) -> Result<bool> {
        let Some((slug, task_id, answer)) = parse_answer(text) else {
            return Ok(false);
        };

        let plan_path = self.layout.plan_path(&slug);
        if !plan_path.exists() {
            tracing::debug!(slug = %slug, "answer names a plan that does not exist");
            return Ok(false);
        }
        let mut file = PlanFile::load(&plan_path)?;
        match file.task(&task_id) {
            Ok(task) if task.status == TaskStatus::Suspended => {}
            _ => return Ok(false),
        }

        file.resume_with_answer(&task_id, &answer)?;
        // A plan wedged solely on this suspension was marked failed at
        // deadlock; the answer makes it runnable again.
        if file.plan().meta.status == PlanStatus::Failed {
            file.set_plan_status(PlanStatus::InProgress);
        }
        file.save()?;
        tracing::info!(slug = %slug, task_id = %task_id, "suspended task resumed with answer");
        Ok(true)
    }

    /// Answer a question with a small read-only LLM call carrying the
    /// current pipeline state as context.
    async fn answer_question(&self, channel_id: &str, question: &str) -> Result<()> {
        let summary = self.status_summary()?;
        let prompt = format!(
            "You are the status assistant for an autonomous work pipeline. \
             Current pipeline state:\n\n{summary}\n\nAnswer this question briefly:\n{question}"
        );
        match self
            .agent
            .complete(&prompt, drover_core::invoker::PermissionProfile::ReadOnly, None)
            .await
        {
            Ok(answer) => {
                let signed = self.identity.sign(answer.trim());
                self.channels.post(channel_id, &signed).await?;
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "question answering failed");
            }
        }
        Ok(())
    }

    /// Out-of-band notification: the notifications channel when one was
    /// discovered, the log otherwise.
    async fn notify(&self, body: &str) {
        tracing::warn!(body, "pipeline notification");
        if let Some(channel_id) = &self.notifications_channel {
            let signed = self.identity.sign(body);
            if let Err(e) = self.channels.post(channel_id, &signed).await {
                tracing::warn!(error = %e, "failed to post notification");
            }
        }
    }

    /// One-paragraph pipeline state for status replies and question context.
    pub fn status_summary(&self) -> Result<String> {
        let outcome = scanner::scan(&self.layout)?;
        let mut counts = [0usize; 3];
        for item in &outcome.candidates {
            match item.kind {
                WorkItemKind::Defect => counts[0] += 1,
                WorkItemKind::Feature => counts[1] += 1,
                WorkItemKind::Analysis => counts[2] += 1,
            }
        }
        Ok(format!(
            "backlog: {} defects, {} features, {} analysis; paused: {}",
            counts[0], counts[1], counts[2], self.paused
        ))
    }
}

/// Parse `answer <slug> <task-id>[:] <text>`.
fn parse_answer(text: &str) -> Option<(String, String, String)> {
    let rest = text.trim().strip_prefix("answer ")?;
    let (slug, rest) = rest.split_once(char::is_whitespace)?;
    let (task_id, answer) = rest.trim_start().split_once(char::is_whitespace)?;
    let task_id = task_id.trim_end_matches(':');
    let answer = answer.trim();
    if slug.is_empty() || task_id.is_empty() || answer.is_empty() {
        return None;
    }
    Some((slug.to_owned(), task_id.to_owned(), answer.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_messages_parse() {
        let (slug, task, answer) = parse_answer("answer 001-crash 1.1: use postgres").unwrap();
        assert_eq!(slug, "001-crash");
        assert_eq!(task, "1.1");
        assert_eq!(answer, "use postgres");

        assert!(parse_answer("what is the pipeline doing?").is_none());
        assert!(parse_answer("answer 001-crash").is_none());
        assert!(parse_answer("answer 001-crash 1.1:").is_none());
    }
}
