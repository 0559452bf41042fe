//! Thin wrappers over the `git` command line.
//!
//! All version-control work goes through the `git` binary; the orchestrator
//! never links a git library. Commands run synchronously -- they are quick
//! and always happen between tasks, never concurrently with one.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;

/// Errors from running git commands.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),
}

/// One entry of `git status --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// The two-character XY status code.
    pub code: String,
    /// Path relative to the repository root (rename target for renames).
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Run a git command, returning the raw output whatever the exit status.
pub fn run(repo: &Path, args: &[&str]) -> Result<Output, GitError> {
    Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|source| GitError::Spawn {
            command: args.join(" "),
            source,
        })
}

/// Run a git command and require success.
pub fn run_ok(repo: &Path, args: &[&str]) -> Result<Output, GitError> {
    let output = run(repo, args)?;
    if !output.status.success() {
        return Err(GitError::Exit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(output)
}

/// Verify `repo` is inside a git working tree.
pub fn ensure_repo(repo: &Path) -> Result<(), GitError> {
    let output = run(repo, &["rev-parse", "--git-dir"])?;
    if output.status.success() {
        Ok(())
    } else {
        Err(GitError::NotARepo(repo.to_path_buf()))
    }
}

/// Current HEAD commit sha.
pub fn head_commit(repo: &Path) -> Result<String, GitError> {
    let output = run_ok(repo, &["rev-parse", "HEAD"])?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Parsed `git status --porcelain`, rename targets resolved.
pub fn status_porcelain(repo: &Path) -> Result<Vec<StatusEntry>, GitError> {
    let output = run_ok(repo, &["status", "--porcelain"])?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let code = line[..2].to_owned();
            let rest = line[3..].trim();
            // Renames are reported as "old -> new"; the new path is the one
            // that exists on disk.
            let path = match rest.split_once(" -> ") {
                Some((_, new)) => new,
                None => rest,
            };
            StatusEntry {
                code,
                path: unquote(path),
            }
        })
        .collect())
}

/// Stage the given paths.
pub fn add_paths(repo: &Path, paths: &[&str]) -> Result<(), GitError> {
    if paths.is_empty() {
        return Ok(());
    }
    let mut args = vec!["add", "--"];
    args.extend_from_slice(paths);
    run_ok(repo, &args)?;
    Ok(())
}

/// Commit whatever is staged. Returns `false` when there was nothing to
/// commit.
pub fn commit_staged(repo: &Path, message: &str) -> Result<bool, GitError> {
    let staged = run_ok(repo, &["diff", "--cached", "--name-only"])?;
    if String::from_utf8_lossy(&staged.stdout).trim().is_empty() {
        return Ok(false);
    }
    run_ok(repo, &["commit", "-m", message])?;
    Ok(true)
}

/// Stage everything and commit. Returns `false` when the tree was clean.
pub fn commit_all(repo: &Path, message: &str) -> Result<bool, GitError> {
    run_ok(repo, &["add", "-A"])?;
    if status_porcelain(repo)?.is_empty() {
        return Ok(false);
    }
    run_ok(repo, &["commit", "-m", message])?;
    Ok(true)
}

/// Paths with unresolved merge conflicts.
pub fn unmerged_paths(repo: &Path) -> Result<Vec<String>, GitError> {
    let output = run_ok(repo, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_owned())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Strip the quoting git applies to unusual path names.
fn unquote(path: &str) -> String {
    path.trim_matches('"').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        run_ok(dir, &["init", "-q"]).unwrap();
        run_ok(dir, &["config", "user.email", "drover@localhost"]).unwrap();
        run_ok(dir, &["config", "user.name", "drover"]).unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run_ok(dir, &["add", "-A"]).unwrap();
        run_ok(dir, &["commit", "-q", "-m", "init"]).unwrap();
    }

    #[test]
    fn ensure_repo_distinguishes_repos() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(ensure_repo(tmp.path()), Err(GitError::NotARepo(_))));
        init_repo(tmp.path());
        ensure_repo(tmp.path()).unwrap();
    }

    #[test]
    fn status_and_commit_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());

        assert!(status_porcelain(tmp.path()).unwrap().is_empty());
        assert!(!commit_all(tmp.path(), "empty").unwrap());

        std::fs::write(tmp.path().join("new.txt"), "x\n").unwrap();
        let entries = status_porcelain(tmp.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_untracked());
        assert_eq!(entries[0].path, "new.txt");

        assert!(commit_all(tmp.path(), "add new").unwrap());
        assert!(status_porcelain(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn commit_staged_skips_clean_index() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        assert!(!commit_staged(tmp.path(), "noop").unwrap());

        std::fs::write(tmp.path().join("staged.txt"), "y\n").unwrap();
        add_paths(tmp.path(), &["staged.txt"]).unwrap();
        assert!(commit_staged(tmp.path(), "staged only").unwrap());
    }

    #[test]
    fn head_commit_is_a_sha() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        let sha = head_commit(tmp.path()).unwrap();
        assert_eq!(sha.len(), 40);
    }
}
