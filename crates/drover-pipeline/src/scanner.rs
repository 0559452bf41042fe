//! Backlog scanner: discovers work items and orders them for processing.
//!
//! Ordering: defects before features before analysis, then numeric slug
//! prefix, then dependency readiness -- an item whose declared dependency
//! has not completed yields to one that is ready. The completed-slug set is
//! built lazily, only when some candidate actually declares a dependency.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;

use crate::layout::Layout;
use crate::workitem::{WorkItem, WorkItemKind};

/// Result of one backlog scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Active candidates in processing order.
    pub candidates: Vec<WorkItem>,
    /// Items whose status header is terminal but that still sit in an
    /// active backlog directory; the caller must archive them.
    pub strays: Vec<WorkItem>,
}

/// Scan every backlog directory.
pub fn scan(layout: &Layout) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();

    for kind in WorkItemKind::ALL {
        let dir = layout.backlog_dir(kind);
        if !dir.exists() {
            continue;
        }
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        entries.sort();

        for path in entries {
            let item = match WorkItem::load(&path, kind) {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable work item");
                    continue;
                }
            };
            if item.status.is_terminal() {
                // Terminal items must not sit in an active backlog dir.
                outcome.strays.push(item);
            } else {
                outcome.candidates.push(item);
            }
        }
    }

    order_candidates(layout, &mut outcome.candidates);
    Ok(outcome)
}

/// Sort candidates by kind and numeric prefix, then move dependency-blocked
/// items behind ready ones (stable).
fn order_candidates(layout: &Layout, candidates: &mut Vec<WorkItem>) {
    candidates.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.numeric_prefix().cmp(&b.numeric_prefix()))
            .then_with(|| a.slug.cmp(&b.slug))
    });

    // Completed-slug lookup is lazy: skip the directory walk entirely when
    // nothing declares a dependency.
    if candidates.iter().all(|c| c.dependencies.is_empty()) {
        return;
    }
    let completed = completed_slugs(layout);

    let (ready, blocked): (Vec<WorkItem>, Vec<WorkItem>) = candidates
        .drain(..)
        .partition(|item| item.dependencies.iter().all(|dep| completed.contains(dep)));

    for item in &blocked {
        tracing::debug!(slug = %item.slug, deps = ?item.dependencies, "work item yields to ready peers");
    }

    candidates.extend(ready);
    candidates.extend(blocked);
}

/// Slugs that count as completed for dependency purposes: everything in the
/// archive directories plus the `completed/` waypoints.
fn completed_slugs(layout: &Layout) -> HashSet<String> {
    let mut slugs = HashSet::new();
    for kind in WorkItemKind::ALL {
        collect_slugs(&layout.archive_dir(kind), &mut slugs);
        collect_slugs(&layout.completed_waypoint(kind), &mut slugs);
    }
    slugs
}

fn collect_slugs(dir: &Path, slugs: &mut HashSet<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_file() {
            if let Some(stem) = path.file_stem() {
                slugs.insert(stem.to_string_lossy().into_owned());
            }
        }
    }
}
