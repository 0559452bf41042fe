//! drover-pipeline: the work-item lifecycle engine.
//!
//! Scans typed backlog directories, converts channel messages into work
//! items, drives the orchestrator over generated plans, verifies defect
//! fixes, and archives finished items -- recovering cleanly from crashes
//! via the startup sweep.

pub mod agent;
pub mod archive;
pub mod channel;
pub mod daemon;
pub mod intake;
pub mod layout;
pub mod plan_create;
pub mod scanner;
pub mod sweep;
pub mod verify;
pub mod workitem;

pub use archive::{ArchiveOutcome, Archiver};
pub use channel::{ChannelApi, ChannelRole, ChannelSet, Identity};
pub use daemon::{ItemOutcome, Pipeline, PipelineConfig};
pub use layout::Layout;
pub use workitem::{WorkItem, WorkItemKind, WorkItemStatus};
