//! Pre-task stash of uncommitted working-tree changes.
//!
//! Before an agent is spawned, any local changes are stashed away so the
//! agent sees a clean tree plus only its own prospective edits. The plan
//! document is excluded from the stash: the agent may legitimately modify
//! the plan during its slot, and those edits would collide with the stash
//! on restore.

use std::path::Path;

use crate::git::{self, GitError};

/// How the post-task restore resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StashPopOutcome {
    /// No stash existed; nothing to restore.
    Nothing,
    /// Stash applied cleanly.
    Clean,
    /// The only conflict was the transient completion-status file; its
    /// local copy was discarded and the stash re-applied.
    RecoveredCompletionConflict,
    /// A real conflict: merge state was reset and the stash dropped. The
    /// working tree keeps the agent's result; the stashed edits are gone.
    DroppedAfterConflict,
}

/// Stash all uncommitted changes except the plan document.
///
/// Returns `true` when a stash entry was created.
pub fn push(repo: &Path, plan_file_name: &str) -> Result<bool, GitError> {
    if git::status_porcelain(repo)?.is_empty() {
        return Ok(false);
    }

    let exclude = format!(":(exclude){plan_file_name}");
    let output = git::run_ok(
        repo,
        &[
            "stash",
            "push",
            "--include-untracked",
            "-m",
            "drover pre-task stash",
            "--",
            ".",
            &exclude,
        ],
    )?;

    let text = String::from_utf8_lossy(&output.stdout);
    Ok(!text.contains("No local changes to save"))
}

/// Restore the pre-task stash after the agent finishes.
///
/// Conflict protocol: a conflict confined to the completion-status file
/// discards that local copy and re-pops; any other conflict resets the
/// merge state, restores a clean checkout, and drops the stash. The
/// repository is never left mid-merge across a task boundary.
pub fn pop(repo: &Path, completion_rel_path: &str) -> Result<StashPopOutcome, GitError> {
    if !has_stash(repo)? {
        return Ok(StashPopOutcome::Nothing);
    }

    if git::run(repo, &["stash", "pop"])?.status.success() {
        return Ok(StashPopOutcome::Clean);
    }

    let unmerged = git::unmerged_paths(repo)?;
    let only_completion =
        !unmerged.is_empty() && unmerged.iter().all(|p| p == completion_rel_path);

    if only_completion {
        // The completion record is transient: the agent's copy wins and the
        // stashed one is discarded.
        git::run_ok(repo, &["checkout", "HEAD", "--", completion_rel_path])
            .or_else(|_| git::run_ok(repo, &["rm", "-f", "--", completion_rel_path]))?;
        if git::run(repo, &["stash", "pop"])?.status.success() {
            return Ok(StashPopOutcome::RecoveredCompletionConflict);
        }
    }

    tracing::warn!(
        repo = %repo.display(),
        unmerged = ?unmerged,
        "stash pop conflicted, resetting merge state and dropping the stash"
    );
    if git::run(repo, &["reset", "--merge"])?.status.success() {
        // reset --merge already restored the tree.
    } else {
        git::run_ok(repo, &["checkout", "-f", "."])?;
    }
    if has_stash(repo)? {
        git::run_ok(repo, &["stash", "drop"])?;
    }
    Ok(StashPopOutcome::DroppedAfterConflict)
}

fn has_stash(repo: &Path) -> Result<bool, GitError> {
    let output = git::run_ok(repo, &["stash", "list"])?;
    Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::run_ok;

    fn init_repo(dir: &Path) {
        run_ok(dir, &["init", "-q"]).unwrap();
        run_ok(dir, &["config", "user.email", "drover@localhost"]).unwrap();
        run_ok(dir, &["config", "user.name", "drover"]).unwrap();
        std::fs::write(dir.join("plan.toml"), "# plan\n").unwrap();
        std::fs::write(dir.join("src.txt"), "original\n").unwrap();
        run_ok(dir, &["add", "-A"]).unwrap();
        run_ok(dir, &["commit", "-q", "-m", "init"]).unwrap();
    }

    #[test]
    fn push_skips_clean_tree() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        assert!(!push(tmp.path(), "plan.toml").unwrap());
        assert_eq!(pop(tmp.path(), ".drover/completion.json").unwrap(), StashPopOutcome::Nothing);
    }

    #[test]
    fn plan_file_edits_survive_the_stash() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());

        std::fs::write(tmp.path().join("plan.toml"), "# plan edited\n").unwrap();
        std::fs::write(tmp.path().join("src.txt"), "dirty\n").unwrap();

        assert!(push(tmp.path(), "plan.toml").unwrap());

        // The plan edit is still visible; the source edit is stashed away.
        let plan = std::fs::read_to_string(tmp.path().join("plan.toml")).unwrap();
        assert_eq!(plan, "# plan edited\n");
        let src = std::fs::read_to_string(tmp.path().join("src.txt")).unwrap();
        assert_eq!(src, "original\n");

        assert_eq!(pop(tmp.path(), ".drover/completion.json").unwrap(), StashPopOutcome::Clean);
        let src = std::fs::read_to_string(tmp.path().join("src.txt")).unwrap();
        assert_eq!(src, "dirty\n");
    }

    #[test]
    fn pop_restores_untracked_files() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());

        std::fs::write(tmp.path().join("scratch.txt"), "notes\n").unwrap();
        assert!(push(tmp.path(), "plan.toml").unwrap());
        assert!(!tmp.path().join("scratch.txt").exists());

        assert_eq!(pop(tmp.path(), ".drover/completion.json").unwrap(), StashPopOutcome::Clean);
        assert!(tmp.path().join("scratch.txt").exists());
    }

    #[test]
    fn conflicting_agent_edit_drops_the_stash_without_merge_state() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());

        // Local edit gets stashed.
        std::fs::write(tmp.path().join("src.txt"), "local change\n").unwrap();
        assert!(push(tmp.path(), "plan.toml").unwrap());

        // The "agent" commits a conflicting change during its slot.
        std::fs::write(tmp.path().join("src.txt"), "agent change\n").unwrap();
        run_ok(tmp.path(), &["add", "-A"]).unwrap();
        run_ok(tmp.path(), &["commit", "-q", "-m", "agent work"]).unwrap();

        let outcome = pop(tmp.path(), ".drover/completion.json").unwrap();
        assert_eq!(outcome, StashPopOutcome::DroppedAfterConflict);

        // No unresolved merge left behind, and the agent's result stands.
        assert!(git::unmerged_paths(tmp.path()).unwrap().is_empty());
        let src = std::fs::read_to_string(tmp.path().join("src.txt")).unwrap();
        assert_eq!(src, "agent change\n");
        assert!(!has_stash(tmp.path()).unwrap());
    }
}
