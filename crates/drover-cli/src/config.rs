//! Configuration file management.
//!
//! A TOML config file at `~/.config/drover/config.toml` with the
//! resolution chain: CLI flag > environment variable > config file >
//! default. Everything resolves once at startup into an immutable value
//! that is threaded through; nothing reads the environment later.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use drover_core::breaker::{CircuitBreaker, DEFAULT_COOLDOWN, DEFAULT_THRESHOLD};
use drover_core::invoker::{resolve_agent_command, AgentCommand, InvokerConfig};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub agent: AgentSection,
    pub breaker: BreakerSection,
    pub pipeline: PipelineSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Explicit path to the agent binary; PATH discovery when unset.
    pub binary: Option<PathBuf>,
    pub task_timeout_secs: u64,
    pub roles_dir: PathBuf,
    pub validator_model: String,
    /// Must stay true; set to false only to prove the startup check works.
    pub suppress_prompts: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            binary: None,
            task_timeout_secs: 900,
            roles_dir: PathBuf::from("roles"),
            validator_model: "validator-default".to_owned(),
            suppress_prompts: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN.as_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub channel_prefix: String,
    pub display_name: String,
    pub max_verification_cycles: u32,
    pub poll_interval_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            channel_prefix: "drover".to_owned(),
            display_name: "drover-pipeline".to_owned(),
            max_verification_cycles: 3,
            poll_interval_secs: 30,
        }
    }
}

// -----------------------------------------------------------------------
// Paths & loading
// -----------------------------------------------------------------------

/// Config directory: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load the config file; a missing file yields the defaults.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config at {}", path.display()))
        }
    };
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

// -----------------------------------------------------------------------
// Resolved configuration
// -----------------------------------------------------------------------

/// Everything the commands need, resolved once.
#[derive(Debug)]
pub struct DroverConfig {
    pub agent_command: AgentCommand,
    pub invoker: InvokerConfig,
    pub breaker: CircuitBreaker,
    pub pipeline: PipelineSection,
}

impl DroverConfig {
    /// Resolve using: CLI flag > env var > config file > default.
    pub fn resolve(agent_binary_flag: Option<PathBuf>) -> Result<Self> {
        let file = load_config()?;

        let binary_override = agent_binary_flag
            .or_else(|| std::env::var_os("DROVER_AGENT_BINARY").map(PathBuf::from))
            .or(file.agent.binary);

        let agent_command = resolve_agent_command(binary_override.as_deref())
            .context("agent binary resolution failed")?;

        let invoker = InvokerConfig {
            task_timeout: Duration::from_secs(file.agent.task_timeout_secs),
            roles_dir: file.agent.roles_dir,
            suppress_prompts: file.agent.suppress_prompts,
            validator_model: file.agent.validator_model,
        };

        let breaker = CircuitBreaker::new(
            file.breaker.threshold,
            Duration::from_secs(file.breaker.cooldown_secs),
        );

        Ok(Self {
            agent_command,
            invoker,
            breaker,
            pipeline: file.pipeline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let file = ConfigFile::default();
        assert_eq!(file.agent.task_timeout_secs, 900);
        assert!(file.agent.suppress_prompts);
        assert_eq!(file.breaker.threshold, 3);
        assert_eq!(file.pipeline.max_verification_cycles, 3);
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
[agent]
task_timeout_secs = 60

[pipeline]
channel_prefix = "acme"
"#,
        )
        .unwrap();
        assert_eq!(file.agent.task_timeout_secs, 60);
        assert_eq!(file.agent.roles_dir, PathBuf::from("roles"));
        assert_eq!(file.pipeline.channel_prefix, "acme");
        assert_eq!(file.pipeline.poll_interval_secs, 30);
    }
}
