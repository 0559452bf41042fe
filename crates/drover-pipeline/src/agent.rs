//! Text-in/text-out agent calls for the pipeline.
//!
//! The pipeline's own agent invocations (intake analysis, verification,
//! plan creation, question answering) want a final text, not the
//! orchestrator's completion-record protocol. The trait keeps the concrete
//! CLI behind a seam so tests can substitute a scripted agent.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use drover_core::invoker::{AgentCommand, PermissionProfile};

/// A blocking-call agent: one prompt in, one text out.
#[async_trait]
pub trait TextAgent: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        profile: PermissionProfile,
        model: Option<&str>,
    ) -> Result<String>;
}

/// Runs the resolved agent CLI in print mode and captures its stdout.
#[derive(Debug, Clone)]
pub struct CliTextAgent {
    command: AgentCommand,
    workdir: PathBuf,
    timeout: Duration,
    suppress_prompts: bool,
}

impl CliTextAgent {
    pub fn new(command: AgentCommand, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            timeout,
            suppress_prompts: true,
        }
    }
}

#[async_trait]
impl TextAgent for CliTextAgent {
    async fn complete(
        &self,
        prompt: &str,
        profile: PermissionProfile,
        model: Option<&str>,
    ) -> Result<String> {
        let mut cmd = std::process::Command::new(&self.command.program);
        cmd.args(&self.command.prefix_args);
        cmd.arg("-p").arg(prompt);
        if let Some(model) = model {
            cmd.arg("--model").arg(model);
        }
        cmd.args(profile.spawn_args(self.suppress_prompts)?);
        cmd.current_dir(&self.workdir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().context("failed to spawn pipeline agent")?;

        let mut stdout_pipe = child.stdout.take();
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        match tokio::time::timeout(self.timeout, async {
            let (status, stdout) = tokio::join!(child.wait(), read_stdout);
            (status, stdout)
        })
        .await
        {
            Ok((Ok(status), stdout)) if status.success() => Ok(stdout),
            Ok((Ok(status), stdout)) => {
                anyhow::bail!(
                    "pipeline agent exited with {status}; output: {}",
                    stdout.trim()
                )
            }
            Ok((Err(e), _)) => Err(e).context("failed to wait on pipeline agent"),
            Err(_) => {
                let _ = child.kill().await;
                anyhow::bail!("pipeline agent timed out after {}s", self.timeout.as_secs())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted agent: pops canned responses in order and records prompts.
    pub struct ScriptedAgent {
        responses: Mutex<Vec<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedAgent {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
                prompts: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl TextAgent for ScriptedAgent {
        async fn complete(
            &self,
            prompt: &str,
            _profile: PermissionProfile,
            _model: Option<&str>,
        ) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_owned());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .context("scripted agent ran out of responses")
        }
    }
}
