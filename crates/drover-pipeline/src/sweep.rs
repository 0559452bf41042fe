//! Startup sweep: reconcile archival state left behind by a crash.
//!
//! The archiver moves a file and then commits; dying between the two leaves
//! a moved-but-uncommitted file. On startup (and best-effort on SIGTERM)
//! the sweep stages everything uncommitted under the archival directories
//! and creates a single recovery commit, closing the gap without atomic
//! filesystem operations.

use anyhow::Result;

use drover_core::git;

use crate::layout::Layout;

/// Commit message used for recovery commits.
pub const RECOVERY_COMMIT_MESSAGE: &str =
    "recover uncommitted archival artifacts from interrupted pipeline";

/// Stage and commit orphaned archival artifacts. Returns `true` when a
/// recovery commit was created.
pub fn startup_sweep(layout: &Layout) -> Result<bool> {
    let root = layout.root();
    let prefixes = layout.archival_prefixes();

    let entries = git::status_porcelain(root)?;
    let orphaned: Vec<String> = entries
        .iter()
        .filter(|entry| is_archival(&entry.path, &entry.code, &prefixes))
        .map(|entry| entry.path.clone())
        .collect();

    if orphaned.is_empty() {
        return Ok(false);
    }

    tracing::warn!(
        count = orphaned.len(),
        paths = ?orphaned,
        "found uncommitted archival artifacts, committing recovery"
    );

    let refs: Vec<&str> = orphaned.iter().map(String::as_str).collect();
    git::add_paths(root, &refs)?;
    let committed = git::commit_staged(root, RECOVERY_COMMIT_MESSAGE)?;
    Ok(committed)
}

/// An entry belongs to the sweep when it sits under an archival prefix, or
/// when it is a deletion inside a backlog directory (the vacated half of an
/// interrupted move).
fn is_archival(path: &str, code: &str, prefixes: &[String]) -> bool {
    if prefixes.iter().any(|p| path.starts_with(p.as_str())) {
        return true;
    }
    let deleted = code.contains('D');
    deleted && path.starts_with("backlog/")
}

/// The same sweep, swallowing errors: called from the SIGTERM path where
/// there is nothing left to do about a failure but log it.
pub fn sweep_best_effort(layout: &Layout) {
    if let Err(e) = startup_sweep(layout) {
        tracing::error!(error = %format!("{e:#}"), "best-effort archival sweep failed");
    }
}

/// Convenience check used by tests and the daemon's health reporting.
pub fn has_orphaned_artifacts(layout: &Layout) -> Result<bool> {
    let prefixes = layout.archival_prefixes();
    Ok(git::status_porcelain(layout.root())?
        .iter()
        .any(|entry| is_archival(&entry.path, &entry.code, &prefixes)))
}
