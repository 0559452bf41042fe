//! Typed model of the plan document.
//!
//! These types map directly to the on-disk `plan.toml` format. Unknown keys
//! are captured in flattened tables so that a load/save cycle never drops
//! fields this version of the code does not understand.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError {
                kind: "plan status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Suspended,
}

impl TaskStatus {
    /// Terminal-success states: the task needs no further work and does not
    /// block dependents.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// States that block every dependent task.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, Self::Failed | Self::Suspended | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "suspended" => Ok(Self::Suspended),
            other => Err(StatusParseError {
                kind: "task status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Error returned when parsing an invalid status string.
#[derive(Debug, Clone)]
pub struct StatusParseError {
    kind: &'static str,
    value: String,
}

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for StatusParseError {}

/// How a task's agent is run. `AgentTeam` is recognized but executed as a
/// single process; the team runtime is external to this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Single,
    AgentTeam,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Single => "single",
            Self::AgentTeam => "agent_team",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Document structure
// ---------------------------------------------------------------------------

/// Top-level structure of a `plan.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    /// Plan metadata in `[meta]`.
    pub meta: PlanMeta,
    /// Ordered sections; document order is the scheduler tie-break.
    #[serde(default)]
    pub sections: Vec<Section>,
    /// Unknown top-level keys, preserved across load/save.
    #[serde(flatten)]
    pub extra: toml::Table,
}

/// Plan-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanMeta {
    /// Human-readable plan name.
    pub name: String,
    /// One-line description of the unit of work.
    pub description: String,
    /// Path to the companion plan markdown document.
    pub plan_doc: String,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Default per-task attempt cap.
    pub max_attempts_default: u32,
    /// Starting model for tasks that don't name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Optional model-escalation policy for retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_escalation: Option<ModelEscalation>,
    /// Top-level plan status.
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(flatten)]
    pub extra: toml::Table,
}

/// Retry model-escalation policy: attempts beyond `after_attempt` walk the
/// ladder instead of using the task's starting model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEscalation {
    /// Models to escalate through, weakest first.
    pub ladder: Vec<String>,
    /// Attempts numbered above this threshold escalate.
    pub after_attempt: u32,
}

impl ModelEscalation {
    /// Effective model for attempt `k` (1-based). Attempts at or below the
    /// threshold keep `starting`; later attempts index into the ladder,
    /// clamped to its last rung.
    pub fn effective_model<'a>(&'a self, starting: Option<&'a str>, attempt: u32) -> Option<&'a str> {
        if attempt <= self.after_attempt || self.ladder.is_empty() {
            return starting;
        }
        let idx = ((attempt - 1) as usize).min(self.ladder.len() - 1);
        Some(self.ladder[idx].as_str())
    }
}

/// A named, ordered group of tasks. Sections convey narrative grouping only;
/// dependencies are expressed at the task level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    /// Section identifier, e.g. `"2"`.
    pub id: String,
    /// Section name.
    pub name: String,
    /// Derived status; recomputed from the tasks on every save.
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Section {
    /// A section is completed exactly when all its tasks are in a
    /// terminal-success state.
    pub fn derived_status(&self) -> TaskStatus {
        if self.tasks.iter().all(|t| t.status.is_terminal_success()) {
            TaskStatus::Completed
        } else if self.tasks.iter().any(|t| t.status != TaskStatus::Pending) {
            TaskStatus::InProgress
        } else {
            TaskStatus::Pending
        }
    }
}

/// The atomic scheduling unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Identifier unique across the plan, e.g. `"3.2"`.
    pub id: String,
    /// Short task name.
    pub name: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Free-text description; the prompt-seed payload handed to the agent.
    pub description: String,
    /// Task ids that must be `completed` before this task is runnable.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Tasks sharing a tag are candidates to run concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// Opaque resource names; tasks holding a resource in common never run
    /// concurrently.
    #[serde(default)]
    pub exclusive_resources: Vec<String>,
    /// Per-task attempt cap; falls back to `meta.max_attempts_default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Attempts consumed so far; persisted across orchestrator restarts.
    #[serde(default)]
    pub attempts: u32,
    /// Agent-role assignment (persona), opaque to the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    /// Starting model override for this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Accumulated findings from verification agents.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_findings: Vec<String>,
    #[serde(flatten)]
    pub extra: toml::Table,
}

/// Execution state of a task, derived from the persisted fields. Collapses
/// the "set after execution" optionals into one value for display and
/// logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRunState {
    /// Never started.
    Never,
    /// Currently running its `attempt`-th attempt (1-based).
    Running { attempt: u32 },
    /// Reached a terminal or suspended state.
    Done {
        outcome: TaskStatus,
        message: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    },
}

impl Task {
    /// Effective attempt cap for this task.
    pub fn attempt_cap(&self, plan_default: u32) -> u32 {
        self.max_attempts.unwrap_or(plan_default)
    }

    /// Derive the run state from the persisted fields.
    pub fn run_state(&self) -> TaskRunState {
        match self.status {
            TaskStatus::Pending if self.attempts == 0 => TaskRunState::Never,
            TaskStatus::Pending | TaskStatus::InProgress => TaskRunState::Running {
                attempt: self.attempts.max(1),
            },
            outcome => TaskRunState::Done {
                outcome,
                message: self.result_message.clone().or_else(|| self.last_error.clone()),
                completed_at: self.completed_at,
            },
        }
    }
}

impl Plan {
    /// Iterate tasks in document order (section order, then task order).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.sections.iter().flat_map(|s| s.tasks.iter())
    }

    /// Look up a task by id.
    pub fn find_task(&self, id: &str) -> Option<&Task> {
        self.tasks().find(|t| t.id == id)
    }

    /// Mutable lookup by id.
    pub fn find_task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.sections
            .iter_mut()
            .flat_map(|s| s.tasks.iter_mut())
            .find(|t| t.id == id)
    }

    /// True when every task is in a terminal-success state and the plan has
    /// not been marked failed (a deadlocked plan is never "fully completed",
    /// whatever its tasks say).
    pub fn is_fully_completed(&self) -> bool {
        self.meta.status != PlanStatus::Failed
            && self.tasks().all(|t| t.status.is_terminal_success())
    }

    /// Effective model for one attempt of one task, honoring the escalation
    /// ladder when the plan declares one.
    pub fn effective_model<'a>(&'a self, task: &'a Task, attempt: u32) -> Option<&'a str> {
        let starting = task.model.as_deref().or(self.meta.model.as_deref());
        match &self.meta.model_escalation {
            Some(esc) => esc.effective_model(starting, attempt),
            None => starting,
        }
    }
}
