//! Plan document persistence.
//!
//! [`PlanFile`] couples the typed [`Plan`] view with a `toml_edit` document
//! so that saves preserve comments, key ordering, and fields this version of
//! the code does not understand. All status mutations go through typed
//! methods that keep both views in sync; [`PlanFile::save`] is atomic
//! (temp file in the same directory, then rename).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use toml_edit::{value, DocumentMut, Item};

use super::types::{Plan, PlanStatus, Task, TaskStatus};
use super::validate::{validate, PlanValidationError};

/// Errors from loading, validating, or saving a plan document.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan at {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plan at {path} is not valid TOML: {source}")]
    Syntax {
        path: PathBuf,
        #[source]
        source: toml_edit::TomlError,
    },

    /// A required field is missing or has the wrong shape.
    #[error("plan at {path} does not match the plan schema: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("plan at {path} failed validation: {source}")]
    Validation {
        path: PathBuf,
        #[source]
        source: PlanValidationError,
    },

    #[error("failed to write plan at {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no task with id {0:?} in plan")]
    UnknownTask(String),
}

/// A plan document bound to its on-disk path.
#[derive(Debug)]
pub struct PlanFile {
    path: PathBuf,
    doc: DocumentMut,
    plan: Plan,
}

impl PlanFile {
    /// Load and validate a plan document.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PlanError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|source| PlanError::Read {
            path: path.clone(),
            source,
        })?;

        let doc: DocumentMut = content.parse().map_err(|source| PlanError::Syntax {
            path: path.clone(),
            source,
        })?;

        let plan: Plan = toml::from_str(&content).map_err(|source| PlanError::Schema {
            path: path.clone(),
            source,
        })?;

        validate(&plan).map_err(|source| PlanError::Validation {
            path: path.clone(),
            source,
        })?;

        Ok(Self { path, doc, plan })
    }

    /// Re-read the document from disk, replacing the in-memory state. Called
    /// after an agent reports `plan_modified: true`.
    pub fn reload(&mut self) -> Result<(), PlanError> {
        let fresh = Self::load(self.path.clone())?;
        self.doc = fresh.doc;
        self.plan = fresh.plan;
        Ok(())
    }

    /// Atomically write the document back to its path. Section statuses are
    /// recomputed from their tasks first.
    pub fn save(&mut self) -> Result<(), PlanError> {
        self.roll_up_section_statuses();

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| PlanError::Write {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(tmp.path(), self.doc.to_string()).map_err(|source| PlanError::Write {
            path: self.path.clone(),
            source,
        })?;
        tmp.persist(&self.path).map_err(|e| PlanError::Write {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Borrow a task by id.
    pub fn task(&self, id: &str) -> Result<&Task, PlanError> {
        self.plan
            .find_task(id)
            .ok_or_else(|| PlanError::UnknownTask(id.to_owned()))
    }

    // -- typed mutations ----------------------------------------------------

    pub fn set_plan_status(&mut self, status: PlanStatus) {
        self.plan.meta.status = status;
        self.doc["meta"]["status"] = value(status.to_string());
    }

    pub fn set_task_status(&mut self, id: &str, status: TaskStatus) -> Result<(), PlanError> {
        self.with_task(id, |task, entry| {
            task.status = status;
            entry["status"] = value(status.to_string());
        })
    }

    /// Begin a new attempt: increment the persisted counter and mark the task
    /// `in_progress`. Returns the attempt number (1-based). The caller must
    /// save before spawning the agent so the agent observes its own task as
    /// `in_progress`.
    pub fn begin_attempt(&mut self, id: &str) -> Result<u32, PlanError> {
        let mut attempt = 0;
        self.with_task(id, |task, entry| {
            task.attempts += 1;
            task.status = TaskStatus::InProgress;
            attempt = task.attempts;
            entry["attempts"] = value(i64::from(task.attempts));
            entry["status"] = value(TaskStatus::InProgress.to_string());
        })?;
        Ok(attempt)
    }

    /// Record a terminal success for a task.
    pub fn record_success(&mut self, id: &str, message: &str) -> Result<(), PlanError> {
        let now = Utc::now();
        self.with_task(id, |task, entry| {
            task.status = TaskStatus::Completed;
            task.result_message = Some(message.to_owned());
            task.completed_at = Some(now);
            entry["status"] = value(TaskStatus::Completed.to_string());
            entry["result_message"] = value(message);
            entry["completed_at"] = value(format_ts(now));
        })
    }

    /// Record a failed attempt. The task returns to `pending` while attempts
    /// remain, otherwise becomes terminally `failed`.
    pub fn record_failure(&mut self, id: &str, error: &str) -> Result<TaskStatus, PlanError> {
        let default_cap = self.plan.meta.max_attempts_default;
        let mut next = TaskStatus::Failed;
        let now = Utc::now();
        self.with_task(id, |task, entry| {
            next = if task.attempts < task.attempt_cap(default_cap) {
                TaskStatus::Pending
            } else {
                TaskStatus::Failed
            };
            task.status = next;
            task.last_error = Some(error.to_owned());
            entry["status"] = value(next.to_string());
            entry["last_error"] = value(error);
            if next == TaskStatus::Failed {
                task.completed_at = Some(now);
                entry["completed_at"] = value(format_ts(now));
            }
        })?;
        Ok(next)
    }

    /// Record a suspension: the agent asked a question and cannot proceed.
    pub fn record_suspension(&mut self, id: &str, question: &str) -> Result<(), PlanError> {
        self.with_task(id, |task, entry| {
            task.status = TaskStatus::Suspended;
            task.last_error = Some(question.to_owned());
            entry["status"] = value(TaskStatus::Suspended.to_string());
            entry["last_error"] = value(question);
        })
    }

    /// Resume a suspended task with an out-of-band answer: the answer is
    /// appended to the description and the task returns to `pending`. The
    /// attempt counter is left untouched.
    pub fn resume_with_answer(&mut self, id: &str, answer: &str) -> Result<(), PlanError> {
        self.with_task(id, |task, entry| {
            task.description = format!("{}\n\nAnswer to open question: {answer}", task.description);
            task.status = TaskStatus::Pending;
            entry["description"] = value(task.description.clone());
            entry["status"] = value(TaskStatus::Pending.to_string());
        })
    }

    /// Append a verification finding to the task's accumulated list.
    pub fn append_validation_finding(&mut self, id: &str, finding: &str) -> Result<(), PlanError> {
        self.with_task(id, |task, entry| {
            task.validation_findings.push(finding.to_owned());
            let item = entry
                .entry("validation_findings")
                .or_insert(Item::Value(toml_edit::Array::new().into()));
            if let Some(arr) = item.as_array_mut() {
                arr.push(finding);
            }
        })
    }

    // -- internals ----------------------------------------------------------

    /// Run a closure against both the typed task and its document entry.
    fn with_task<F>(&mut self, id: &str, mut f: F) -> Result<(), PlanError>
    where
        F: FnMut(&mut Task, &mut toml_edit::Table),
    {
        // Locate the (section, task) position in the typed view first.
        let mut pos = None;
        'outer: for (si, section) in self.plan.sections.iter().enumerate() {
            for (ti, task) in section.tasks.iter().enumerate() {
                if task.id == id {
                    pos = Some((si, ti));
                    break 'outer;
                }
            }
        }
        let (si, ti) = pos.ok_or_else(|| PlanError::UnknownTask(id.to_owned()))?;

        let entry = self
            .doc
            .get_mut("sections")
            .and_then(Item::as_array_of_tables_mut)
            .and_then(|sections| sections.get_mut(si))
            .and_then(|section| section.get_mut("tasks"))
            .and_then(Item::as_array_of_tables_mut)
            .and_then(|tasks| tasks.get_mut(ti))
            .ok_or_else(|| PlanError::UnknownTask(id.to_owned()))?;

        let task = &mut self.plan.sections[si].tasks[ti];
        f(task, entry);
        Ok(())
    }

    /// Recompute derived section statuses in both views.
    fn roll_up_section_statuses(&mut self) {
        let statuses: Vec<TaskStatus> =
            self.plan.sections.iter().map(|s| s.derived_status()).collect();
        for (section, status) in self.plan.sections.iter_mut().zip(&statuses) {
            section.status = *status;
        }
        if let Some(sections) = self.doc.get_mut("sections").and_then(Item::as_array_of_tables_mut)
        {
            for (i, status) in statuses.iter().enumerate() {
                if let Some(table) = sections.get_mut(i) {
                    table["status"] = value(status.to_string());
                }
            }
        }
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
