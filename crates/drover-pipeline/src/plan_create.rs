//! Plan creation: a planner-role agent turns a work item into a plan
//! document.
//!
//! The agent's sole deliverable is the plan TOML written to the plans
//! directory. The result is validated with the plan loader; a missing,
//! empty, or invalid file earns one retry with the failure as context.

use std::path::PathBuf;

use anyhow::Result;
use thiserror::Error;

use drover_core::invoker::PermissionProfile;
use drover_core::plan::{PlanError, PlanFile};

use crate::agent::TextAgent;
use crate::layout::Layout;
use crate::workitem::WorkItem;

/// Ways a generated plan can be unusable.
#[derive(Debug, Error)]
pub enum PlanCreateError {
    #[error("planner agent did not create {0}")]
    FileNotCreated(PathBuf),

    #[error("planner agent wrote an empty file at {0}")]
    EmptyFile(PathBuf),

    #[error("generated plan is invalid: {source}")]
    Invalid {
        #[source]
        source: PlanError,
    },
}

/// TOML schema reference included in the planner prompt.
const SCHEMA_REFERENCE: &str = r#"## Plan TOML Schema

```toml
[meta]
name = "short-plan-name"            # REQUIRED
description = "one line"            # REQUIRED
plan_doc = "plans/<slug>.md"        # REQUIRED, companion document path
created = "2026-01-01T00:00:00Z"    # REQUIRED, quoted ISO-8601 UTC
max_attempts_default = 3            # REQUIRED
# model = "tier1"                   # Optional starting model

[[sections]]
id = "1"                            # REQUIRED, ordered
name = "Section name"               # REQUIRED

[[sections.tasks]]
id = "1.1"                          # REQUIRED, unique across the plan
name = "short-task-name"            # REQUIRED
description = """                   # REQUIRED, the agent's full brief
What to do, which files, what not to touch.
"""
# depends_on = ["1.1"]              # Optional task ids that must complete first
# parallel_group = "g1"             # Optional concurrency tag
# exclusive_resources = ["db"]      # Optional resource locks
# max_attempts = 2                  # Optional per-task attempt cap
# agent = "developer"               # Optional role
```
"#;

/// Decomposition guidance included in the planner prompt.
const PLANNING_GUIDELINES: &str = r#"## Planning Guidelines

1. Prefer narrow tasks that touch few files; name the files in the description.
2. Express every ordering constraint through `depends_on`, never through prose.
3. Tasks that can safely run together may share a `parallel_group`; give tasks
   that touch the same subsystem a common entry in `exclusive_resources`.
4. Each description must stand alone: the executing agent sees only its task
   plus the plan for reference.
5. Do not implement anything yourself; the plan file is your only deliverable.
"#;

/// Build the planner prompt for a work item.
pub fn build_planner_prompt(item: &WorkItem, output_path: &str) -> String {
    let mut prompt = String::with_capacity(4096);
    prompt.push_str(
        "You are a planning agent. Decompose the work item below into a \
         dependency-ordered plan for coding agents to execute.\n\n",
    );
    prompt.push_str(&format!(
        "Write the plan TOML to `{output_path}` using your Write tool. Do NOT \
         print the TOML to your output.\n\n"
    ));
    prompt.push_str(SCHEMA_REFERENCE);
    prompt.push('\n');
    prompt.push_str(PLANNING_GUIDELINES);
    prompt.push_str("\n## Work Item\n\n");
    prompt.push_str(&item.body);
    prompt
}

/// Validate a freshly generated plan file.
pub fn validate_generated_plan(path: &PathBuf) -> Result<(), PlanCreateError> {
    if !path.exists() {
        return Err(PlanCreateError::FileNotCreated(path.clone()));
    }
    let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if len == 0 {
        return Err(PlanCreateError::EmptyFile(path.clone()));
    }
    PlanFile::load(path)
        .map(|_| ())
        .map_err(|source| PlanCreateError::Invalid { source })
}

/// Create and validate the plan for a work item, retrying once on a bad
/// result. Returns the plan path.
pub async fn create_plan(
    agent: &dyn TextAgent,
    layout: &Layout,
    item: &WorkItem,
) -> Result<PathBuf> {
    let path = layout.plan_path(&item.slug);
    std::fs::create_dir_all(layout.plans_dir())?;
    let rel = format!("plans/{}.toml", item.slug);

    let prompt = build_planner_prompt(item, &rel);
    agent
        .complete(&prompt, PermissionProfile::Design, None)
        .await?;

    match validate_generated_plan(&path) {
        Ok(()) => return Ok(path),
        Err(err) => {
            tracing::warn!(slug = %item.slug, error = %err, "generated plan unusable, retrying once");
            let retry_prompt = format!(
                "{prompt}\n\n## Previous Attempt\n\nYour previous plan was rejected: {err}\n\
                 Fix the problem and write a valid plan to `{rel}`."
            );
            agent
                .complete(&retry_prompt, PermissionProfile::Design, None)
                .await?;
        }
    }

    validate_generated_plan(&path)?;
    Ok(path)
}
