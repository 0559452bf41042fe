//! Task prompt assembly.
//!
//! The prompt handed to a spawned agent is a markdown document: an optional
//! role preamble read from the roles directory, a task preamble that states
//! the attempt number, the task description, plan context for reference,
//! and the instruction protocol ending with the completion-record
//! requirement.

use std::path::Path;

use crate::plan::{ExecutionMode, Plan, Task};

/// Read the role preamble for a task's agent role, if it has one.
///
/// The preamble is the markdown file `<roles_dir>/<role>.md`. A missing
/// file is an error: a plan that names a role expects that persona to
/// exist.
pub fn load_role_preamble(roles_dir: &Path, role: &str) -> std::io::Result<String> {
    std::fs::read_to_string(roles_dir.join(format!("{role}.md")))
}

/// Build the full prompt for one attempt of one task.
pub fn build_task_prompt(
    plan: &Plan,
    task: &Task,
    attempt: u32,
    role_preamble: Option<&str>,
) -> String {
    let mut out = String::with_capacity(4096);

    if let Some(preamble) = role_preamble {
        out.push_str(preamble.trim_end());
        out.push_str("\n\n---\n\n");
    }

    out.push_str(&format!("# Task {}: {}\n\n", task.id, task.name));
    out.push_str(&format!("**Attempt:** {attempt}\n\n"));

    if attempt <= 1 {
        out.push_str("This is a fresh start: no prior attempt has touched this task.\n\n");
    } else {
        out.push_str(
            "A previous attempt at this task failed. Verify the current state of the \
             working tree before acting; partial changes from the earlier attempt may \
             already be present.\n\n",
        );
        if let Some(err) = &task.last_error {
            out.push_str("## Previous Attempt Feedback\n\n");
            out.push_str(err.trim());
            out.push_str("\n\n");
        }
    }

    out.push_str("## Description\n\n");
    out.push_str(task.description.trim());
    out.push_str("\n\n");

    if !task.depends_on.is_empty() {
        out.push_str("## Dependencies\n\n");
        for dep in &task.depends_on {
            let status = plan
                .find_task(dep)
                .map(|d| d.status.to_string())
                .unwrap_or_else(|| "unknown".to_owned());
            out.push_str(&format!("- **{dep}**: {status}\n"));
        }
        out.push('\n');
    }

    if task.execution_mode == Some(ExecutionMode::AgentTeam) {
        out.push_str(
            "## Execution Mode\n\nThis task is flagged for cooperating-team execution. \
             Coordinate sub-work as you see fit; the orchestrator observes only your \
             completion record.\n\n",
        );
    }

    out.push_str("## Plan Context (for reference)\n\n");
    out.push_str(&format!(
        "Plan: **{}** -- {}\n\n",
        plan.meta.name, plan.meta.description
    ));
    for section in &plan.sections {
        out.push_str(&format!("### {} {}\n", section.id, section.name));
        for t in &section.tasks {
            let marker = if t.id == task.id { " <- you are here" } else { "" };
            out.push_str(&format!("- [{}] {} {}{}\n", t.status, t.id, t.name, marker));
        }
        out.push('\n');
    }

    out.push_str(INSTRUCTION_PROTOCOL);
    out
}

/// Version-controlled instruction protocol appended to every task prompt.
const INSTRUCTION_PROTOCOL: &str = r#"## Instruction Protocol

1. Work only on the task described above. Other tasks belong to other agents.
2. Commit any code changes you produce with a descriptive message.
3. You may edit the plan document itself (for example to append follow-up
   tasks you discovered); if you do, set `plan_modified` to `true` in your
   completion record.
4. If you need out-of-band input to proceed, stop and report status
   `suspended` with a `question` payload instead of guessing.
5. When you are done -- success or failure -- write your completion record
   as JSON to `.drover/completion.json` in your working directory:

```json
{
  "schema_version": 1,
  "task_id": "<this task's id>",
  "status": "completed | failed | suspended",
  "message": "<one-paragraph summary of what happened>",
  "timestamp": "<ISO-8601 UTC>",
  "plan_modified": false
}
```

An exit without this file is treated as a failure.
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_plan() -> Plan {
        toml::from_str(
            r#"
[meta]
name = "demo"
description = "demo plan"
plan_doc = "plans/demo.md"
created = "2026-07-30T12:00:00Z"
max_attempts_default = 3

[[sections]]
id = "1"
name = "Setup"

[[sections.tasks]]
id = "1.1"
name = "init"
description = "initialize the thing"

[[sections.tasks]]
id = "1.2"
name = "build"
description = "build the thing"
depends_on = ["1.1"]
last_error = "cargo build failed: missing semicolon"
"#,
        )
        .unwrap()
    }

    #[test]
    fn first_attempt_states_fresh_start() {
        let plan = fixture_plan();
        let task = plan.find_task("1.1").unwrap();
        let prompt = build_task_prompt(&plan, task, 1, None);
        assert!(prompt.contains("fresh start"));
        assert!(!prompt.contains("previous attempt"));
        assert!(prompt.contains(".drover/completion.json"));
    }

    #[test]
    fn retry_attempt_demands_state_verification() {
        let plan = fixture_plan();
        let task = plan.find_task("1.2").unwrap();
        let prompt = build_task_prompt(&plan, task, 2, None);
        assert!(prompt.contains("previous attempt at this task failed"));
        assert!(prompt.contains("Verify the current state"));
        assert!(prompt.contains("missing semicolon"), "last error is surfaced");
    }

    #[test]
    fn dependencies_and_plan_context_included() {
        let plan = fixture_plan();
        let task = plan.find_task("1.2").unwrap();
        let prompt = build_task_prompt(&plan, task, 1, None);
        assert!(prompt.contains("- **1.1**: pending"));
        assert!(prompt.contains("<- you are here"));
        assert!(prompt.contains("Plan: **demo**"));
    }

    #[test]
    fn role_preamble_is_prepended() {
        let plan = fixture_plan();
        let task = plan.find_task("1.1").unwrap();
        let prompt = build_task_prompt(&plan, task, 1, Some("You are the build engineer."));
        assert!(prompt.starts_with("You are the build engineer."));
    }

    #[test]
    fn missing_role_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_role_preamble(tmp.path(), "ghost").is_err());

        std::fs::write(tmp.path().join("developer.md"), "# Developer\n").unwrap();
        assert_eq!(
            load_role_preamble(tmp.path(), "developer").unwrap(),
            "# Developer\n"
        );
    }
}
