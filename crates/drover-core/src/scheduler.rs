//! Dependency-aware task selection.
//!
//! The scheduler is pure: it inspects a [`Plan`] and answers "what runs
//! next". Document order (section order, then task order) is the tie-break.

use std::collections::HashSet;

use crate::plan::{Plan, Task, TaskStatus};

/// What the scheduler found when asked for the next step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerVerdict {
    /// Run these tasks next. One id means sequential execution; more than
    /// one means a parallel batch that passed the disjointness checks.
    Run(Vec<String>),
    /// Every task is in a terminal-success state; the plan is done.
    AllDone,
    /// No task can ever become runnable: something upstream failed or is
    /// suspended. `blocked` names the stuck tasks.
    Deadlock { blocked: Vec<String> },
}

/// A task is runnable iff it is `pending` and every dependency is
/// `completed`.
fn is_runnable(plan: &Plan, task: &Task) -> bool {
    task.status == TaskStatus::Pending
        && task.depends_on.iter().all(|dep| {
            plan.find_task(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
}

/// First runnable task in document order.
pub fn next_runnable(plan: &Plan) -> Option<&Task> {
    plan.tasks().find(|t| is_runnable(plan, t))
}

/// Decide the next scheduler step.
///
/// "Done" and "deadlocked" are distinct and never conflated: an empty
/// runnable set means success only when every task is `completed` or
/// `skipped`. Otherwise some task is wedged behind a `failed` or
/// `suspended` upstream (or is itself terminally failed or suspended), and
/// the plan is deadlocked.
pub fn assess(plan: &Plan, parallel: bool) -> SchedulerVerdict {
    if let Some(task) = next_runnable(plan) {
        let batch = if parallel {
            parallel_batch(plan, task)
        } else {
            vec![task.id.clone()]
        };
        return SchedulerVerdict::Run(batch);
    }

    if plan.tasks().all(|t| t.status.is_terminal_success()) {
        return SchedulerVerdict::AllDone;
    }

    // Non-terminal tasks wedged behind a failed or suspended dependency.
    let mut blocked: Vec<String> = plan
        .tasks()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
        .filter(|t| {
            t.depends_on.iter().any(|dep| {
                plan.find_task(dep).is_some_and(|d| {
                    matches!(d.status, TaskStatus::Failed | TaskStatus::Suspended)
                })
            })
        })
        .map(|t| t.id.clone())
        .collect();

    // A terminally failed or suspended task with no dependents still makes
    // the plan unfinishable; report it as the stuck set.
    if blocked.is_empty() {
        blocked = plan
            .tasks()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Suspended))
            .map(|t| t.id.clone())
            .collect();
    }

    SchedulerVerdict::Deadlock { blocked }
}

/// Select a maximal parallel batch seeded by `first`.
///
/// Candidates are the runnable tasks sharing `first`'s `parallel_group`.
/// The whole group must be pairwise disjoint in `exclusive_resources` and
/// in the file paths mentioned by their descriptions; any conflict drops
/// the group back to sequential execution.
fn parallel_batch(plan: &Plan, first: &Task) -> Vec<String> {
    let Some(group) = first.parallel_group.as_deref() else {
        return vec![first.id.clone()];
    };

    let candidates: Vec<&Task> = plan
        .tasks()
        .filter(|t| is_runnable(plan, t))
        .filter(|t| t.parallel_group.as_deref() == Some(group))
        .collect();

    if candidates.len() < 2 {
        return vec![first.id.clone()];
    }

    for (i, a) in candidates.iter().enumerate() {
        for b in &candidates[i + 1..] {
            if tasks_conflict(a, b) {
                tracing::debug!(
                    group = group,
                    a = %a.id,
                    b = %b.id,
                    "parallel group has a resource or file conflict, running sequentially"
                );
                return vec![first.id.clone()];
            }
        }
    }

    candidates.into_iter().map(|t| t.id.clone()).collect()
}

/// Two tasks conflict when they share an exclusive resource or mention a
/// common file path.
fn tasks_conflict(a: &Task, b: &Task) -> bool {
    let a_res: HashSet<&str> = a.exclusive_resources.iter().map(String::as_str).collect();
    if b.exclusive_resources.iter().any(|r| a_res.contains(r.as_str())) {
        return true;
    }
    let a_files = parse_file_paths(&a.description);
    let b_files = parse_file_paths(&b.description);
    !a_files.is_disjoint(&b_files)
}

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "toml", "md", "py", "js", "ts", "json", "yaml", "yml", "sh", "sql", "go", "c", "h",
    "cpp", "java", "rb", "txt",
];

/// Extract path-shaped tokens from a task description.
///
/// A token counts as a path when it contains a `/` or carries a known
/// source-file extension. Surrounding backticks, quotes, brackets, and
/// trailing punctuation are stripped first.
pub fn parse_file_paths(description: &str) -> HashSet<String> {
    let mut paths = HashSet::new();
    for raw in description.split_whitespace() {
        let token = raw
            .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | '(' | ')' | '[' | ']'))
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':'));
        if token.is_empty() || token.contains("://") {
            continue;
        }
        let has_slash = token.contains('/') && !token.starts_with("//");
        let has_ext = token
            .rsplit_once('.')
            .is_some_and(|(stem, ext)| !stem.is_empty() && SOURCE_EXTENSIONS.contains(&ext));
        if has_slash || has_ext {
            paths.insert(token.to_owned());
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;

    fn plan_from(tasks_toml: &str) -> Plan {
        let src = format!(
            r#"
[meta]
name = "t"
description = "t"
plan_doc = "plans/t.md"
created = "2026-07-30T12:00:00Z"
max_attempts_default = 3

[[sections]]
id = "1"
name = "s"
{tasks_toml}
"#
        );
        toml::from_str(&src).expect("fixture should parse")
    }

    #[test]
    fn picks_first_pending_in_document_order() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "1.1"
name = "a"
description = "x"
status = "completed"

[[sections.tasks]]
id = "1.2"
name = "b"
description = "x"

[[sections.tasks]]
id = "1.3"
name = "c"
description = "x"
"#,
        );
        assert_eq!(next_runnable(&plan).unwrap().id, "1.2");
    }

    #[test]
    fn dependency_gates_selection() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "1.1"
name = "a"
description = "x"

[[sections.tasks]]
id = "1.2"
name = "b"
description = "x"
depends_on = ["1.1"]
"#,
        );
        // 1.2 is not runnable until 1.1 completes.
        assert_eq!(next_runnable(&plan).unwrap().id, "1.1");
    }

    #[test]
    fn all_terminal_success_is_all_done() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "1.1"
name = "a"
description = "x"
status = "completed"

[[sections.tasks]]
id = "1.2"
name = "b"
description = "x"
status = "skipped"
"#,
        );
        assert_eq!(assess(&plan, false), SchedulerVerdict::AllDone);
    }

    #[test]
    fn failed_upstream_is_deadlock_not_done() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "1.1"
name = "a"
description = "x"
status = "failed"

[[sections.tasks]]
id = "2.1"
name = "b"
description = "x"
depends_on = ["1.1"]
"#,
        );
        match assess(&plan, false) {
            SchedulerVerdict::Deadlock { blocked } => assert_eq!(blocked, vec!["2.1"]),
            other => panic!("expected deadlock, got {other:?}"),
        }
    }

    #[test]
    fn suspended_upstream_blocks_dependents() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "1.1"
name = "a"
description = "x"
status = "suspended"

[[sections.tasks]]
id = "1.2"
name = "b"
description = "x"
depends_on = ["1.1"]
"#,
        );
        assert!(matches!(assess(&plan, false), SchedulerVerdict::Deadlock { .. }));
    }

    #[test]
    fn lone_terminal_failure_is_deadlock() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "1.1"
name = "a"
description = "x"
status = "failed"
"#,
        );
        match assess(&plan, false) {
            SchedulerVerdict::Deadlock { blocked } => assert_eq!(blocked, vec!["1.1"]),
            other => panic!("expected deadlock, got {other:?}"),
        }
    }

    #[test]
    fn parallel_batch_groups_disjoint_tasks() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "2.1"
name = "a"
description = "edit src/alpha.rs"
parallel_group = "g"

[[sections.tasks]]
id = "2.2"
name = "b"
description = "edit src/beta.rs"
parallel_group = "g"
"#,
        );
        assert_eq!(
            assess(&plan, true),
            SchedulerVerdict::Run(vec!["2.1".to_owned(), "2.2".to_owned()])
        );
    }

    #[test]
    fn shared_exclusive_resource_forces_sequential() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "2.1"
name = "a"
description = "edit src/alpha.rs"
parallel_group = "g"
exclusive_resources = ["db"]

[[sections.tasks]]
id = "2.2"
name = "b"
description = "edit src/beta.rs"
parallel_group = "g"
exclusive_resources = ["db"]
"#,
        );
        assert_eq!(assess(&plan, true), SchedulerVerdict::Run(vec!["2.1".to_owned()]));
    }

    #[test]
    fn overlapping_file_mentions_force_sequential() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "2.1"
name = "a"
description = "edit src/shared.rs and src/alpha.rs"
parallel_group = "g"

[[sections.tasks]]
id = "2.2"
name = "b"
description = "edit src/shared.rs differently"
parallel_group = "g"
"#,
        );
        assert_eq!(assess(&plan, true), SchedulerVerdict::Run(vec!["2.1".to_owned()]));
    }

    #[test]
    fn parallel_disabled_always_sequential() {
        let plan = plan_from(
            r#"
[[sections.tasks]]
id = "2.1"
name = "a"
description = "x"
parallel_group = "g"

[[sections.tasks]]
id = "2.2"
name = "b"
description = "y"
parallel_group = "g"
"#,
        );
        assert_eq!(assess(&plan, false), SchedulerVerdict::Run(vec!["2.1".to_owned()]));
    }

    #[test]
    fn file_path_tokens() {
        let paths = parse_file_paths(
            "Update `src/main.rs` and config.toml; see https://example.com/docs and notes.",
        );
        assert!(paths.contains("src/main.rs"));
        assert!(paths.contains("config.toml"));
        assert!(!paths.iter().any(|p| p.contains("example.com")), "urls are not files: {paths:?}");
    }
}
