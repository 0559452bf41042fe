//! The `drover status` command: print plan and task state.

use std::path::Path;

use drover_core::plan::{PlanFile, TaskRunState};

/// Print a plan summary; returns the process exit code.
pub fn run(plan_path: &Path) -> i32 {
    let file = match PlanFile::load(plan_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("cannot load plan: {e}");
            return 1;
        }
    };

    let plan = file.plan();
    println!("{} [{}] -- {}", plan.meta.name, plan.meta.status, plan.meta.description);

    for section in &plan.sections {
        println!("\n{} {} [{}]", section.id, section.name, section.derived_status());
        for task in &section.tasks {
            let detail = match task.run_state() {
                TaskRunState::Never => String::new(),
                TaskRunState::Running { attempt } => format!(" (attempt {attempt})"),
                TaskRunState::Done { message, .. } => match message {
                    Some(m) => format!(" -- {}", first_line(&m)),
                    None => String::new(),
                },
            };
            println!("  [{:<11}] {} {}{detail}", task.status.to_string(), task.id, task.name);
        }
    }
    0
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}
