//! Structural validation of a loaded plan.
//!
//! Checks that task ids are unique, `depends_on` references resolve, and the
//! dependency graph is acyclic (Kahn's algorithm).

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::types::Plan;

/// Errors from validating the plan structure.
#[derive(Debug, Error)]
pub enum PlanValidationError {
    #[error("plan must contain at least one task")]
    NoTasks,

    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),
}

/// Validate a parsed plan.
pub fn validate(plan: &Plan) -> Result<(), PlanValidationError> {
    let tasks: Vec<_> = plan.tasks().collect();
    if tasks.is_empty() {
        return Err(PlanValidationError::NoTasks);
    }

    let mut seen = HashSet::new();
    for task in &tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(PlanValidationError::DuplicateTaskId(task.id.clone()));
        }
    }

    for task in &tasks {
        for dep in &task.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(PlanValidationError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(plan)
}

/// Detect dependency cycles via topological sort. Returns `Ok(())` for a DAG,
/// or an error naming the tasks left with unresolved in-degree.
fn check_for_cycles(plan: &Plan) -> Result<(), PlanValidationError> {
    let ids: Vec<&str> = plan.tasks().map(|t| t.id.as_str()).collect();
    let id_to_idx: HashMap<&str, usize> =
        ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let n = ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for task in plan.tasks() {
        let task_idx = id_to_idx[task.id.as_str()];
        for dep in &task.depends_on {
            let dep_idx = id_to_idx[dep.as_str()];
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut sorted = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted != n {
        let cycle: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| ids[i])
            .collect();
        return Err(PlanValidationError::CycleDetected(cycle.join(", ")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_from(toml_str: &str) -> Plan {
        toml::from_str(toml_str).expect("fixture should parse")
    }

    const HEADER: &str = r#"
[meta]
name = "t"
description = "t"
plan_doc = "plans/t.md"
created = "2026-07-30T12:00:00Z"
max_attempts_default = 3
"#;

    fn with_tasks(tasks: &str) -> String {
        format!("{HEADER}\n[[sections]]\nid = \"1\"\nname = \"s\"\n{tasks}")
    }

    fn task_block(id: &str, deps: &[&str]) -> String {
        let deps = deps
            .iter()
            .map(|d| format!("{d:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "[[sections.tasks]]\nid = \"{id}\"\nname = \"t{id}\"\ndescription = \"x\"\ndepends_on = [{deps}]\n"
        )
    }

    #[test]
    fn accepts_diamond_dag() {
        let src = with_tasks(&format!(
            "{}{}{}{}",
            task_block("a", &[]),
            task_block("b", &["a"]),
            task_block("c", &["a"]),
            task_block("d", &["b", "c"]),
        ));
        validate(&plan_from(&src)).expect("diamond DAG should be valid");
    }

    #[test]
    fn rejects_empty_plan() {
        let src = format!("{HEADER}\n[[sections]]\nid = \"1\"\nname = \"s\"\n");
        let err = validate(&plan_from(&src)).unwrap_err();
        assert!(matches!(err, PlanValidationError::NoTasks));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let src = with_tasks(&format!("{}{}", task_block("a", &[]), task_block("a", &[])));
        let err = validate(&plan_from(&src)).unwrap_err();
        assert!(matches!(err, PlanValidationError::DuplicateTaskId(ref id) if id == "a"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let src = with_tasks(&task_block("a", &["ghost"]));
        let err = validate(&plan_from(&src)).unwrap_err();
        assert!(matches!(err, PlanValidationError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_transitive_cycle() {
        let src = with_tasks(&format!(
            "{}{}{}",
            task_block("a", &["c"]),
            task_block("b", &["a"]),
            task_block("c", &["b"]),
        ));
        let err = validate(&plan_from(&src)).unwrap_err();
        assert!(matches!(err, PlanValidationError::CycleDetected(_)));
    }

    #[test]
    fn dependencies_may_cross_sections() {
        let src = format!(
            "{HEADER}\n[[sections]]\nid = \"1\"\nname = \"one\"\n{}\n[[sections]]\nid = \"2\"\nname = \"two\"\n{}",
            task_block("1.1", &[]),
            task_block("2.1", &["1.1"]),
        );
        validate(&plan_from(&src)).expect("cross-section deps should be valid");
    }
}
