//! Shared test utilities for drover integration tests.
//!
//! Provides temporary git repositories, plan fixtures, and scripted fake
//! agents: shell scripts that stand in for the real agent CLI, parse the
//! task id out of the prompt they are handed, and write completion records
//! the way a well-behaved agent would.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// A temporary git repository with an initial commit.
pub struct TestRepo {
    // Held for the lifetime of the repo directory.
    _dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    /// Create a repo with a configured identity and one initial commit.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();

        git(&root, &["init", "-q"]);
        git(&root, &["config", "user.email", "drover-test@localhost"]);
        git(&root, &["config", "user.name", "drover-test"]);
        std::fs::write(root.join("README.md"), "test fixture\n").unwrap();
        git(&root, &["add", "-A"]);
        git(&root, &["commit", "-q", "-m", "initial commit"]);

        Self { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a file relative to the repo root, creating parent dirs.
    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root.join(rel))
            .unwrap_or_else(|e| panic!("failed to read {rel}: {e}"))
    }

    /// Stage and commit everything. A clean tree is a no-op.
    pub fn commit_all(&self, message: &str) {
        git(&self.root, &["add", "-A"]);
        if self.status_lines().is_empty() {
            return;
        }
        git(&self.root, &["commit", "-q", "-m", message]);
    }

    /// Commit subjects, newest first.
    pub fn log_subjects(&self) -> Vec<String> {
        let output = Command::new("git")
            .args(["log", "--format=%s"])
            .current_dir(&self.root)
            .output()
            .expect("git log failed");
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// `git status --porcelain` lines.
    pub fn status_lines(&self) -> Vec<String> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.root)
            .output()
            .expect("git status failed");
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

// ---------------------------------------------------------------------------
// Plan fixtures
// ---------------------------------------------------------------------------

/// Minimal task spec for [`plan_toml`].
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub id: &'static str,
    pub description: &'static str,
    pub depends_on: &'static [&'static str],
    pub max_attempts: Option<u32>,
    pub parallel_group: Option<&'static str>,
    pub exclusive_resources: &'static [&'static str],
}

impl TaskSpec {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            description: "do the scripted thing",
            ..Self::default()
        }
    }
}

/// Render a single-section plan document.
pub fn plan_toml(name: &str, max_attempts_default: u32, tasks: &[TaskSpec]) -> String {
    let mut out = format!(
        r#"[meta]
name = "{name}"
description = "fixture plan"
plan_doc = "plans/{name}.md"
created = "2026-07-30T12:00:00Z"
max_attempts_default = {max_attempts_default}

[[sections]]
id = "1"
name = "Fixture"
"#
    );
    for task in tasks {
        out.push_str(&format!(
            "\n[[sections.tasks]]\nid = \"{}\"\nname = \"task-{}\"\ndescription = \"{}\"\n",
            task.id,
            task.id.replace('.', "-"),
            task.description,
        ));
        if !task.depends_on.is_empty() {
            let deps: Vec<String> = task.depends_on.iter().map(|d| format!("{d:?}")).collect();
            out.push_str(&format!("depends_on = [{}]\n", deps.join(", ")));
        }
        if let Some(cap) = task.max_attempts {
            out.push_str(&format!("max_attempts = {cap}\n"));
        }
        if let Some(group) = task.parallel_group {
            out.push_str(&format!("parallel_group = \"{group}\"\n"));
        }
        if !task.exclusive_resources.is_empty() {
            let res: Vec<String> =
                task.exclusive_resources.iter().map(|r| format!("{r:?}")).collect();
            out.push_str(&format!("exclusive_resources = [{}]\n", res.join(", ")));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Fake agent
// ---------------------------------------------------------------------------

/// Configurable scripted agent. The generated shell script extracts the
/// task id from the prompt it receives, tracks per-task attempt counts in
/// the working directory, and writes a completion record.
#[derive(Debug, Clone, Default)]
pub struct FakeAgent {
    /// Report `failed` for this many attempts per task before succeeding.
    pub fail_times: u32,
    /// Restrict the scripted failures to one task id.
    pub fail_only_task: Option<String>,
    /// On success, write this file (relative path, content).
    pub touch_file: Option<(String, String)>,
    /// On success, write `out-<task id>.txt` in the working directory.
    pub touch_task_file: bool,
    /// On the first success, append this TOML text to the given plan file
    /// and set `plan_modified: true` (relative plan path, text).
    pub append_to_plan: Option<(String, String)>,
    /// Report `suspended` with this question instead of completing.
    pub suspend_with_question: Option<String>,
    /// Exit without writing any completion record.
    pub no_completion: bool,
    /// Sleep before answering (for timeout tests).
    pub sleep_secs: u32,
}

impl FakeAgent {
    /// Write the agent script into `dir` and return its path.
    pub fn install(&self, dir: &Path) -> PathBuf {
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, self.render()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn render(&self) -> String {
        let mut script = String::from(
            r#"#!/bin/sh
set -u
PROMPT="${2:-}"
TASK_ID=$(printf '%s\n' "$PROMPT" | sed -n 's/^# Task \([0-9A-Za-z._-]*\):.*/\1/p' | head -n 1)
[ -n "$TASK_ID" ] || TASK_ID=unknown
"#,
        );

        if self.sleep_secs > 0 {
            script.push_str(&format!("sleep {}\n", self.sleep_secs));
        }

        script.push_str(
            r#"COUNT_FILE=".fake-attempts-$TASK_ID"
N=0
[ -f "$COUNT_FILE" ] && N=$(cat "$COUNT_FILE")
N=$((N + 1))
printf '%s' "$N" > "$COUNT_FILE"
"#,
        );

        if self.no_completion {
            script.push_str("echo 'fake agent exiting without a record'\nexit 0\n");
            return script;
        }

        script.push_str("mkdir -p .drover\nTS=$(date -u +%Y-%m-%dT%H:%M:%SZ)\n");

        if let Some(question) = &self.suspend_with_question {
            script.push_str(&format!(
                r#"cat > .drover/completion.json <<EOF
{{"schema_version":1,"task_id":"$TASK_ID","status":"suspended","message":"need input","timestamp":"$TS","plan_modified":false,"question":{{"text":"{question}","context":"scripted"}}}}
EOF
exit 0
"#
            ));
            return script;
        }

        let fail_guard = match &self.fail_only_task {
            Some(id) => format!("[ \"$TASK_ID\" = '{id}' ] && [ \"$N\" -le {} ]", self.fail_times),
            None => format!("[ \"$N\" -le {} ]", self.fail_times),
        };
        script.push_str(&format!(
            r#"if {fail_guard}; then
  cat > .drover/completion.json <<EOF
{{"schema_version":1,"task_id":"$TASK_ID","status":"failed","message":"scripted failure $N","timestamp":"$TS","plan_modified":false}}
EOF
  exit 0
fi
"#
        ));

        if let Some((rel, content)) = &self.touch_file {
            script.push_str(&format!(
                "mkdir -p \"$(dirname '{rel}')\"\nprintf '%s\\n' '{content}' > '{rel}'\n"
            ));
        }
        if self.touch_task_file {
            script.push_str("printf 'made by %s\\n' \"$TASK_ID\" > \"out-$TASK_ID.txt\"\n");
        }

        script.push_str("MODIFIED=false\n");
        if let Some((plan_rel, toml_text)) = &self.append_to_plan {
            script.push_str(&format!(
                r#"if [ ! -f .plan-appended ]; then
  cat >> '{plan_rel}' <<'PLANEOF'
{toml_text}
PLANEOF
  touch .plan-appended
  MODIFIED=true
fi
"#
            ));
        }

        script.push_str(
            r#"cat > .drover/completion.json <<EOF
{"schema_version":1,"task_id":"$TASK_ID","status":"completed","message":"scripted success on attempt $N","timestamp":"$TS","plan_modified":$MODIFIED}
EOF
"#,
        );
        script
    }
}
