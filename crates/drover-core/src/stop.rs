//! Graceful-stop semaphore.
//!
//! A plain file in the plan directory. Any sibling process, signal handler,
//! or operator can create it without knowing the orchestrator PID; the
//! orchestrator checks for it before selecting each new task and finishes
//! the current one before exiting.

use std::path::{Path, PathBuf};

/// Name of the semaphore file inside the plan directory.
pub const STOP_FILE: &str = ".drover-stop";

#[derive(Debug, Clone)]
pub struct StopSemaphore {
    path: PathBuf,
}

impl StopSemaphore {
    /// Semaphore for the directory containing the given plan file.
    pub fn for_plan(plan_path: &Path) -> Self {
        let dir = plan_path.parent().unwrap_or_else(|| Path::new("."));
        Self {
            path: dir.join(STOP_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a stop has been requested.
    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Request a stop. Used by the pipeline's control verbs and by tests.
    pub fn set(&self) -> std::io::Result<()> {
        std::fs::write(&self.path, b"")
    }

    /// Remove a leftover semaphore from a previous run. Called once at
    /// orchestrator startup.
    pub fn clear_stale(&self) -> std::io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::warn!(path = %self.path.display(), "removed stale stop semaphore");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
