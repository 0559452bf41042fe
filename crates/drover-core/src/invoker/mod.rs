//! Agent invoker: spawns the external agent process for one task attempt,
//! streams its output, enforces the timeout, handles rate-limit backoff,
//! and translates the completion record into a task outcome.
//!
//! The invoker owns no plan state. It reports what happened; the
//! orchestrator decides what that means for the plan.

pub mod binary;
pub mod completion;
pub mod permissions;
pub mod prompt;
pub mod ratelimit;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use crate::plan::{Plan, Task};
use crate::usage::UsageSample;

pub use binary::{resolve_agent_command, AgentBinaryNotFound, AgentCommand};
pub use completion::{CompletionError, CompletionRecord, Question, ReportedStatus};
pub use permissions::{InteractivePermissionsError, PermissionProfile};

/// Environment-variable prefixes stripped from the child so a spawned agent
/// does not detect a parent-agent context.
const SANITIZED_ENV_PREFIXES: &[&str] = &["CLAUDE", "DROVER"];

/// Grace period between SIGTERM and SIGKILL when tearing down a timed-out
/// agent's process group.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Invoker settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Wall-clock limit per agent invocation.
    pub task_timeout: Duration,
    /// Directory of role-preamble markdown files.
    pub roles_dir: PathBuf,
    /// Must be true; a false value is rejected when building spawn flags.
    pub suppress_prompts: bool,
    /// Fixed model for verification agents, exempt from escalation.
    pub validator_model: String,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(900),
            roles_dir: PathBuf::from("roles"),
            suppress_prompts: true,
            validator_model: "validator-default".to_owned(),
        }
    }
}

/// What one finished invocation means for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOutcome {
    Completed,
    Failed,
    Suspended,
}

/// Result of a single agent invocation (after rate-limit retries).
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub outcome: AgentOutcome,
    pub message: String,
    pub plan_modified: bool,
    pub question: Option<Question>,
    pub usage: UsageSample,
}

/// Everything needed to spawn one attempt of one task.
#[derive(Debug)]
pub struct Invocation<'a> {
    pub plan: &'a Plan,
    pub task: &'a Task,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Working directory for the agent (project root or its worktree).
    pub workdir: &'a Path,
    /// Compact plan identifier prefixed to streamed log lines.
    pub plan_prefix: &'a str,
    /// Effective model for this attempt, when one is configured.
    pub model: Option<String>,
    pub profile: PermissionProfile,
}

enum RunOnce {
    Finished(InvocationResult),
    RateLimited(ratelimit::RateLimitHit),
}

/// Spawns agent processes. Holds the resolved agent command and the invoker
/// configuration; both are immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct AgentInvoker {
    command: AgentCommand,
    config: InvokerConfig,
}

impl AgentInvoker {
    pub fn new(command: AgentCommand, config: InvokerConfig) -> Self {
        Self { command, config }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Run one task attempt to completion.
    ///
    /// Rate-limited runs sleep until the reported reset (plus buffer) and
    /// retry without consuming the attempt; everything else returns after a
    /// single spawn.
    pub async fn run(&self, inv: &Invocation<'_>) -> Result<InvocationResult> {
        loop {
            match self.run_once(inv).await? {
                RunOnce::Finished(result) => return Ok(result),
                RunOnce::RateLimited(hit) => {
                    let pause = ratelimit::sleep_duration(&hit, Utc::now());
                    tracing::warn!(
                        task_id = %inv.task.id,
                        plan = inv.plan_prefix,
                        reset_at = ?hit.reset_at,
                        pause_secs = pause.as_secs(),
                        "agent rate limited, sleeping until reset"
                    );
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    async fn run_once(&self, inv: &Invocation<'_>) -> Result<RunOnce> {
        let invocation_id = Uuid::new_v4();

        completion::clear(inv.workdir).with_context(|| {
            format!("failed to clear stale completion record in {}", inv.workdir.display())
        })?;

        let role_preamble = match inv.task.agent.as_deref() {
            Some(role) => Some(
                prompt::load_role_preamble(&self.config.roles_dir, role)
                    .with_context(|| format!("missing role preamble for {role:?}"))?,
            ),
            None => None,
        };
        let prompt_text =
            prompt::build_task_prompt(inv.plan, inv.task, inv.attempt, role_preamble.as_deref());

        if let Some(model) = &inv.model {
            tracing::info!(
                task_id = %inv.task.id,
                plan = inv.plan_prefix,
                attempt = inv.attempt,
                model = %model,
                %invocation_id,
                "spawning agent"
            );
        } else {
            tracing::info!(
                task_id = %inv.task.id,
                plan = inv.plan_prefix,
                attempt = inv.attempt,
                %invocation_id,
                "spawning agent"
            );
        }

        let mut child = self
            .build_command(inv, &prompt_text)?
            .spawn()
            .with_context(|| {
                format!("failed to spawn agent {:?}", self.command.program)
            })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let prefix = inv.plan_prefix.to_owned();

        // Drain both pipes concurrently with the wait so a chatty agent
        // cannot deadlock on a full pipe buffer.
        let read_stdout = async {
            let mut captured = String::new();
            let mut usage = UsageSample::default();
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "drover::agent", "[{prefix}] {line}");
                    if let Some(sample) = parse_usage_line(&line) {
                        usage.absorb(sample);
                    }
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            (captured, usage)
        };

        let read_stderr = async {
            let mut captured = String::new();
            if let Some(err) = stderr {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "drover::agent", "[{prefix}] {line}");
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            captured
        };

        let waited = tokio::time::timeout(self.config.task_timeout, async {
            let (status, (out, usage), err) = tokio::join!(child.wait(), read_stdout, read_stderr);
            (status, out, usage, err)
        })
        .await;

        let (status, captured_out, usage, captured_err) = match waited {
            Ok((status, out, usage, err)) => (status, out, usage, err),
            Err(_elapsed) => {
                tracing::warn!(
                    task_id = %inv.task.id,
                    plan = inv.plan_prefix,
                    timeout_secs = self.config.task_timeout.as_secs(),
                    "agent timed out, terminating process tree"
                );
                terminate_process_group(pid, &mut child).await;
                return Ok(RunOnce::Finished(InvocationResult {
                    outcome: AgentOutcome::Failed,
                    message: format!(
                        "timeout after {}s",
                        self.config.task_timeout.as_secs()
                    ),
                    plan_modified: false,
                    question: None,
                    usage: UsageSample::default(),
                }));
            }
        };

        if let Err(e) = status {
            return Err(e).context("failed to wait on agent process");
        }

        // Rate limit: retry the same attempt after the reset.
        if let Some(hit) =
            ratelimit::detect(&captured_out).or_else(|| ratelimit::detect(&captured_err))
        {
            return Ok(RunOnce::RateLimited(hit));
        }

        let result = match completion::read(inv.workdir, &inv.task.id) {
            Ok(record) => InvocationResult {
                outcome: match record.status {
                    ReportedStatus::Completed => AgentOutcome::Completed,
                    ReportedStatus::Failed => AgentOutcome::Failed,
                    ReportedStatus::Suspended => AgentOutcome::Suspended,
                },
                message: record.message,
                plan_modified: record.plan_modified,
                question: record.question,
                usage,
            },
            Err(CompletionError::Missing(_)) => InvocationResult {
                outcome: AgentOutcome::Failed,
                message: "no status file written".to_owned(),
                plan_modified: false,
                question: None,
                usage,
            },
            Err(err) => InvocationResult {
                outcome: AgentOutcome::Failed,
                message: format!("malformed status record: {err}"),
                plan_modified: false,
                question: None,
                usage,
            },
        };

        tracing::info!(
            task_id = %inv.task.id,
            plan = inv.plan_prefix,
            outcome = ?result.outcome,
            %invocation_id,
            "agent finished"
        );

        Ok(RunOnce::Finished(result))
    }

    /// Assemble the child command: resolved program, prompt in argv, stdin
    /// closed, sanitized environment, own process group.
    fn build_command(&self, inv: &Invocation<'_>, prompt_text: &str) -> Result<Command> {
        let mut cmd = std::process::Command::new(&self.command.program);
        cmd.args(&self.command.prefix_args);
        cmd.arg("-p").arg(prompt_text);
        cmd.args(["--output-format", "stream-json", "--verbose"]);
        if let Some(model) = &inv.model {
            cmd.arg("--model").arg(model);
        }
        cmd.args(inv.profile.spawn_args(self.config.suppress_prompts)?);

        cmd.current_dir(inv.workdir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        for (key, _) in std::env::vars_os() {
            let name = key.to_string_lossy().to_ascii_uppercase();
            if SANITIZED_ENV_PREFIXES.iter().any(|p| name.starts_with(p)) {
                cmd.env_remove(&key);
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

/// SIGTERM the child's process group, wait out the grace period, then force
/// kill whatever is left.
async fn terminate_process_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The child was spawned as its own process-group leader.
        unsafe {
            libc::killpg(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

/// Extract token usage from one stream-JSON output line, when present.
fn parse_usage_line(line: &str) -> Option<UsageSample> {
    let v: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let usage = v
        .get("usage")
        .or_else(|| v.get("message").and_then(|m| m.get("usage")))?;
    let input_tokens = usage.get("input_tokens").and_then(|t| t.as_u64()).unwrap_or(0);
    let output_tokens = usage.get("output_tokens").and_then(|t| t.as_u64()).unwrap_or(0);
    let cost_usd = v.get("total_cost_usd").and_then(|c| c.as_f64());
    if input_tokens == 0 && output_tokens == 0 && cost_usd.is_none() {
        return None;
    }
    Some(UsageSample {
        input_tokens,
        output_tokens,
        cost_usd,
    })
}

/// Compact plan identifier for log prefixes: the file name truncated with an
/// ellipsis for readability.
pub fn plan_prefix(path: &Path) -> String {
    const MAX: usize = 18;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    if name.chars().count() <= MAX {
        return name;
    }
    let head: String = name.chars().take(MAX - 1).collect();
    format!("{head}\u{2026}")
}
