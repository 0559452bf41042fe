//! Agent binary resolution.
//!
//! The agent CLI is located once at startup and stored in the immutable
//! environment: first `$PATH`, then known install locations, then the
//! package-runner fallback. A missing binary is a configuration error.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Name of the agent executable searched on `$PATH`.
pub const AGENT_PROGRAM: &str = "claude";

/// Package-runner fallback invocation.
const RUNNER_PROGRAM: &str = "npx";
const RUNNER_PACKAGE: &str = "@anthropic-ai/claude-code";

/// The resolved way to launch the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments that precede the per-invocation flags (empty for a direct
    /// binary, the package spec for the runner fallback).
    pub prefix_args: Vec<String>,
}

impl AgentCommand {
    /// Direct invocation of a binary at `path`.
    pub fn direct(path: impl Into<PathBuf>) -> Self {
        Self {
            program: path.into(),
            prefix_args: vec![],
        }
    }
}

/// Raised when no way to launch the agent can be found.
#[derive(Debug, Error)]
#[error(
    "agent binary {AGENT_PROGRAM:?} not found on PATH, in known install \
     locations, or via {RUNNER_PROGRAM} -- install it or set agent_binary in \
     the config"
)]
pub struct AgentBinaryNotFound;

/// Resolve the agent command, honoring an explicit override first.
pub fn resolve_agent_command(
    override_path: Option<&Path>,
) -> Result<AgentCommand, AgentBinaryNotFound> {
    if let Some(path) = override_path {
        if is_executable(path) {
            return Ok(AgentCommand::direct(path));
        }
        return Err(AgentBinaryNotFound);
    }

    if let Some(found) = search_path(AGENT_PROGRAM) {
        return Ok(AgentCommand::direct(found));
    }

    for candidate in known_locations() {
        if is_executable(&candidate) {
            return Ok(AgentCommand::direct(candidate));
        }
    }

    if search_path(RUNNER_PROGRAM).is_some() {
        return Ok(AgentCommand {
            program: PathBuf::from(RUNNER_PROGRAM),
            prefix_args: vec!["--yes".to_owned(), RUNNER_PACKAGE.to_owned()],
        });
    }

    Err(AgentBinaryNotFound)
}

/// Conventional install locations checked after `$PATH`.
fn known_locations() -> Vec<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/usr/local/bin").join(AGENT_PROGRAM),
        PathBuf::from("/opt/homebrew/bin").join(AGENT_PROGRAM),
    ];
    if let Some(home) = dirs_home() {
        candidates.insert(0, home.join(".claude/local").join(AGENT_PROGRAM));
        candidates.insert(1, home.join(".local/bin").join(AGENT_PROGRAM));
    }
    candidates
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Walk `$PATH` for an executable with the given name.
fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_must_exist() {
        let err = resolve_agent_command(Some(Path::new("/nonexistent/agent"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn override_is_used_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("fake-agent");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let cmd = resolve_agent_command(Some(&bin)).unwrap();
        assert_eq!(cmd.program, bin);
        assert!(cmd.prefix_args.is_empty());
    }
}
