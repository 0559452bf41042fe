//! Archiver: moves finished work items out of the backlog and commits the
//! move.
//!
//! The move and the commit are two separate filesystem operations; a crash
//! between them leaves a moved-but-uncommitted file that the startup sweep
//! reconciles. The archiver itself is idempotent and tolerant of other
//! tools moving the file first.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};

use drover_core::git;

use crate::layout::Layout;
use crate::workitem::WorkItem;

/// What one archive call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// Moved and committed.
    Archived,
    /// The file was already at the destination; nothing moved, nothing
    /// committed.
    AlreadyArchived,
    /// The file was found at the consumer tooling's `completed/` waypoint
    /// and archived from there.
    ArchivedFromWaypoint,
    /// The source is gone and the destination is empty; nothing to do.
    SourceMissing,
    /// This slug was already processed in this session; skipped to break
    /// archival-failure loops.
    AlreadyProcessed,
}

/// Moves work items to the archive and commits the result.
#[derive(Debug)]
pub struct Archiver {
    layout: Layout,
    /// Slugs successfully processed in this session.
    processed: HashSet<String>,
}

impl Archiver {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            processed: HashSet::new(),
        }
    }

    /// Archive one work item.
    pub fn archive(&mut self, item: &WorkItem) -> Result<ArchiveOutcome> {
        if self.processed.contains(&item.slug) {
            tracing::debug!(slug = %item.slug, "already archived in this session, skipping");
            return Ok(ArchiveOutcome::AlreadyProcessed);
        }

        let basename = item
            .path
            .file_name()
            .map(PathBuf::from)
            .context("work item path has no file name")?;
        let destination = self.layout.archive_dir(item.kind).join(&basename);

        // Resolve where the file actually is right now.
        let (source, from_waypoint) = if item.path.exists() {
            (item.path.clone(), false)
        } else {
            let waypoint = self.layout.completed_waypoint(item.kind).join(&basename);
            if waypoint.exists() {
                tracing::warn!(
                    slug = %item.slug,
                    waypoint = %waypoint.display(),
                    "work item found at completed/ waypoint instead of recorded path"
                );
                (waypoint, true)
            } else if destination.exists() {
                self.processed.insert(item.slug.clone());
                return Ok(ArchiveOutcome::AlreadyArchived);
            } else {
                tracing::warn!(slug = %item.slug, "work item vanished before archiving");
                return Ok(ArchiveOutcome::SourceMissing);
            }
        };

        std::fs::create_dir_all(destination.parent().context("archive dir has no parent")?)
            .context("failed to create archive directory")?;
        std::fs::rename(&source, &destination).with_context(|| {
            format!(
                "failed to move {} to {}",
                source.display(),
                destination.display()
            )
        })?;

        // Commit the move as its own operation. A crash between the rename
        // above and this commit is healed by the startup sweep.
        let root = self.layout.root().to_path_buf();
        let rel = |p: &PathBuf| {
            p.strip_prefix(&root)
                .map(|r| r.to_string_lossy().into_owned())
                .unwrap_or_else(|_| p.to_string_lossy().into_owned())
        };
        git::add_paths(&root, &[rel(&destination).as_str()])?;
        // Staging the old path records the deletion; it fails when the item
        // was never tracked, which is fine.
        if let Err(e) = git::add_paths(&root, &[rel(&source).as_str()]) {
            tracing::debug!(slug = %item.slug, error = %e, "source path not tracked");
        }
        git::commit_staged(&root, &format!("archive work item {}", item.slug))?;

        self.processed.insert(item.slug.clone());
        Ok(if from_waypoint {
            ArchiveOutcome::ArchivedFromWaypoint
        } else {
            ArchiveOutcome::Archived
        })
    }
}
