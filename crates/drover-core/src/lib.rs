//! drover-core: the plan orchestrator.
//!
//! Executes a dependency-ordered plan of tasks by spawning external agent
//! processes, observing their outcome through a file-based completion
//! protocol, and persisting every transition back into the plan document.

pub mod breaker;
pub mod git;
pub mod invoker;
pub mod notify;
pub mod orchestrator;
pub mod plan;
pub mod scheduler;
pub mod stash;
pub mod stop;
pub mod usage;
pub mod worktree;

pub use invoker::{AgentCommand, AgentInvoker, InvokerConfig, PermissionProfile};
pub use notify::{LogNotifier, Notifier};
pub use orchestrator::{Orchestrator, OrchestratorOptions, OrchestratorResult};
pub use plan::{Plan, PlanFile, PlanStatus, TaskStatus};
