//! Git worktree management for parallel task isolation.
//!
//! Each task of a parallel batch runs in its own git worktree: a separate
//! checked-out directory sharing the main repository's object store. Git
//! serialises worktree mutations with a lock file on that shared store, so
//! all mutating operations here go through an internal mutex.
//!
//! Results are merged back by **copying files**, not by merging branches:
//! every parallel task touches the plan document, and a branch merge would
//! conflict on it every time.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::git::{self, GitError};
use crate::invoker::completion::RECORD_DIR;

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("worktree path exists with unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    #[error("failed to copy {path} back to the primary working copy")]
    CopyBack {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A created worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeHandle {
    /// Absolute path of the checked-out directory.
    pub path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
    /// HEAD of the main repository at creation time; the diff base for the
    /// copy-back.
    pub base_commit: String,
}

/// Manages worktrees for one repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl WorktreeManager {
    /// Create a manager for `repo_path`. Worktrees land in a sibling
    /// directory named `<repo-name>-drover-worktrees` unless overridden.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();
        git::ensure_repo(&repo_path)?;

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-drover-worktrees");
            repo_path
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Conventional branch name for a plan/task pair.
    pub fn branch_name(plan_name: &str, task_id: &str) -> String {
        format!("drover/{plan_name}/{task_id}")
    }

    /// Create (or reuse) the worktree for a branch. Idempotent: an existing
    /// worktree on the expected branch is returned as-is.
    pub fn create(&self, branch_name: &str) -> Result<WorktreeHandle, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir_name = branch_name.replace('/', "--");
        let worktree_path = self.worktree_base.join(&dir_name);
        let base_commit = git::head_commit(&self.repo_path)?;

        if worktree_path.exists() {
            let existing_branch = current_branch(&worktree_path)?;
            if existing_branch != branch_name {
                return Err(WorktreeError::BranchMismatch {
                    expected: branch_name.to_owned(),
                    found: existing_branch,
                });
            }
            tracing::info!(path = %worktree_path.display(), branch = branch_name, "reusing existing worktree");
            return Ok(WorktreeHandle {
                path: worktree_path,
                branch: branch_name.to_owned(),
                base_commit,
            });
        }

        std::fs::create_dir_all(&self.worktree_base).map_err(|source| {
            WorktreeError::Git(GitError::Spawn {
                command: "worktree add (mkdir base)".to_owned(),
                source,
            })
        })?;

        let path_str = worktree_path.to_string_lossy().into_owned();
        let branch_exists = git::run(
            &self.repo_path,
            &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch_name}")],
        )?
        .status
        .success();

        if branch_exists {
            git::run_ok(&self.repo_path, &["worktree", "add", &path_str, branch_name])?;
        } else {
            git::run_ok(
                &self.repo_path,
                &["worktree", "add", "-b", branch_name, &path_str],
            )?;
        }

        Ok(WorktreeHandle {
            path: worktree_path,
            branch: branch_name.to_owned(),
            base_commit,
        })
    }

    /// Remove a worktree and its branch. Idempotent.
    pub fn remove(&self, handle: &WorktreeHandle) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let path_str = handle.path.to_string_lossy().into_owned();
        let output = git::run(
            &self.repo_path,
            &["worktree", "remove", "--force", &path_str],
        )?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("is not a working tree") {
                return Err(WorktreeError::Git(GitError::Exit {
                    command: "worktree remove".to_owned(),
                    code: output.status.code().unwrap_or(-1),
                    stderr: stderr.trim().to_owned(),
                }));
            }
            if handle.path.exists() {
                let _ = std::fs::remove_dir_all(&handle.path);
            }
        }

        let _ = git::run(&self.repo_path, &["branch", "-D", &handle.branch]);
        Ok(())
    }

    /// Drop stale worktree registrations whose directories are gone.
    pub fn prune(&self) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        git::run_ok(&self.repo_path, &["worktree", "prune"])?;
        Ok(())
    }

    /// Copy the files an agent changed in its worktree back to the primary
    /// working copy.
    ///
    /// Changed files are the diff from the worktree's base commit to its
    /// HEAD plus anything left uncommitted or untracked. The plan document
    /// and the transient completion record are skipped: the primary copy of
    /// the plan is authoritative, and the record belongs to the worktree.
    ///
    /// Returns the repo-relative paths that were copied.
    pub fn copy_back(
        &self,
        handle: &WorktreeHandle,
        plan_file_name: &str,
    ) -> Result<Vec<String>, WorktreeError> {
        let mut changed: Vec<String> = Vec::new();

        let committed = git::run_ok(
            &handle.path,
            &["diff", "--name-only", &handle.base_commit, "HEAD"],
        )?;
        changed.extend(
            String::from_utf8_lossy(&committed.stdout)
                .lines()
                .map(|l| l.trim().to_owned())
                .filter(|l| !l.is_empty()),
        );

        for entry in git::status_porcelain(&handle.path)? {
            changed.push(entry.path);
        }

        changed.sort();
        changed.dedup();
        let record_prefix = format!("{RECORD_DIR}/");
        changed.retain(|p| p != plan_file_name && !p.starts_with(&record_prefix));

        for rel in &changed {
            let src = handle.path.join(rel);
            let dst = self.repo_path.join(rel);
            if !src.exists() {
                // Deleted in the worktree: delete in the primary too.
                if dst.exists() {
                    std::fs::remove_file(&dst).map_err(|source| WorktreeError::CopyBack {
                        path: dst.clone(),
                        source,
                    })?;
                }
                continue;
            }
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).map_err(|source| WorktreeError::CopyBack {
                    path: dst.clone(),
                    source,
                })?;
            }
            std::fs::copy(&src, &dst).map_err(|source| WorktreeError::CopyBack {
                path: dst.clone(),
                source,
            })?;
        }

        Ok(changed)
    }
}

/// Branch currently checked out at `path`.
fn current_branch(path: &Path) -> Result<String, WorktreeError> {
    let output = git::run_ok(path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
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

    fn manager(tmp: &tempfile::TempDir) -> (PathBuf, WorktreeManager) {
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);
        let mgr = WorktreeManager::new(&repo, Some(tmp.path().join("wts"))).unwrap();
        (repo, mgr)
    }

    #[test]
    fn create_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (_repo, mgr) = manager(&tmp);

        let branch = WorktreeManager::branch_name("demo", "2.1");
        let a = mgr.create(&branch).unwrap();
        let b = mgr.create(&branch).unwrap();
        assert_eq!(a.path, b.path);
        assert!(a.path.join("src.txt").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (_repo, mgr) = manager(&tmp);

        let handle = mgr.create("drover/demo/2.1").unwrap();
        mgr.remove(&handle).unwrap();
        assert!(!handle.path.exists());
        mgr.remove(&handle).unwrap();
    }

    #[test]
    fn copy_back_carries_changes_but_not_plan_or_record() {
        let tmp = tempfile::tempdir().unwrap();
        let (repo, mgr) = manager(&tmp);

        let handle = mgr.create("drover/demo/2.1").unwrap();

        // Agent work in the worktree: one committed edit, one new file, a
        // plan edit, and a completion record.
        std::fs::write(handle.path.join("src.txt"), "changed by agent\n").unwrap();
        run_ok(&handle.path, &["add", "-A"]).unwrap();
        run_ok(&handle.path, &["commit", "-q", "-m", "agent edit"]).unwrap();
        std::fs::write(handle.path.join("extra.txt"), "new\n").unwrap();
        std::fs::write(handle.path.join("plan.toml"), "# plan edited in worktree\n").unwrap();
        std::fs::create_dir_all(handle.path.join(".drover")).unwrap();
        std::fs::write(handle.path.join(".drover/completion.json"), "{}").unwrap();

        let copied = mgr.copy_back(&handle, "plan.toml").unwrap();
        assert!(copied.contains(&"src.txt".to_owned()));
        assert!(copied.contains(&"extra.txt".to_owned()));
        assert!(!copied.iter().any(|p| p == "plan.toml"));
        assert!(!copied.iter().any(|p| p.starts_with(".drover")));

        assert_eq!(
            std::fs::read_to_string(repo.join("src.txt")).unwrap(),
            "changed by agent\n"
        );
        assert_eq!(std::fs::read_to_string(repo.join("extra.txt")).unwrap(), "new\n");
        assert_eq!(std::fs::read_to_string(repo.join("plan.toml")).unwrap(), "# plan\n");

        mgr.remove(&handle).unwrap();
    }
}
