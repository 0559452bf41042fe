//! Directory conventions for the pipeline.
//!
//! Work items live in typed backlog directories; finished items move to the
//! matching archive directory. File location is the canonical state; the
//! `Status:` header inside the file is metadata.

use std::path::{Path, PathBuf};

use crate::workitem::WorkItemKind;

/// Subdirectory of a backlog dir used by consumer tooling as a mid-pipeline
/// waypoint for finished items.
pub const COMPLETED_WAYPOINT: &str = "completed";

/// Resolves every pipeline directory from the project root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Active backlog directory for a work-item kind.
    pub fn backlog_dir(&self, kind: WorkItemKind) -> PathBuf {
        self.root.join("backlog").join(kind.dir_name())
    }

    /// The `completed/` waypoint inside a backlog directory.
    pub fn completed_waypoint(&self, kind: WorkItemKind) -> PathBuf {
        self.backlog_dir(kind).join(COMPLETED_WAYPOINT)
    }

    /// Archive directory for a work-item kind.
    pub fn archive_dir(&self, kind: WorkItemKind) -> PathBuf {
        self.root.join("archive").join(kind.dir_name())
    }

    /// Directory of generated plan documents.
    pub fn plans_dir(&self) -> PathBuf {
        self.root.join("plans")
    }

    /// Plan document path for a work-item slug.
    pub fn plan_path(&self, slug: &str) -> PathBuf {
        self.plans_dir().join(format!("{slug}.toml"))
    }

    /// Repo-relative prefixes that hold archival state; the startup sweep
    /// commits anything uncommitted under these.
    pub fn archival_prefixes(&self) -> Vec<String> {
        let mut prefixes = vec!["archive/".to_owned(), "plans/".to_owned()];
        for kind in WorkItemKind::ALL {
            prefixes.push(format!("backlog/{}/{}/", kind.dir_name(), COMPLETED_WAYPOINT));
        }
        prefixes
    }

    /// Create every directory the pipeline expects.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for kind in WorkItemKind::ALL {
            std::fs::create_dir_all(self.backlog_dir(kind))?;
            std::fs::create_dir_all(self.archive_dir(kind))?;
        }
        std::fs::create_dir_all(self.plans_dir())?;
        Ok(())
    }
}
