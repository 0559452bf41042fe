//! The completion record: the sole cross-process handshake from a spawned
//! agent back to the orchestrator.
//!
//! Agents write a JSON document to `.drover/completion.json` inside their
//! working directory. The record is versioned and parsed as untrusted
//! input; a missing or malformed record is a protocol violation charged to
//! the agent.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current schema version written into new records.
pub const SCHEMA_VERSION: u32 = 1;

/// Directory (relative to the agent's working directory) holding the record.
pub const RECORD_DIR: &str = ".drover";

/// File name of the record inside [`RECORD_DIR`].
pub const RECORD_FILE: &str = "completion.json";

/// Resolve the record path for a working directory.
pub fn record_path(workdir: &Path) -> PathBuf {
    workdir.join(RECORD_DIR).join(RECORD_FILE)
}

/// Outcome reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Completed,
    Failed,
    Suspended,
}

/// Question payload accompanying a `suspended` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// The question the agent needs answered before it can proceed.
    pub text: String,
    /// Supporting context for whoever answers.
    #[serde(default)]
    pub context: String,
}

/// The on-disk completion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub task_id: String,
    pub status: ReportedStatus,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub plan_modified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
}

fn default_schema_version() -> u32 {
    1
}

/// Ways reading a completion record can fail. Every variant is treated as an
/// agent protocol violation except `Io`.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("no status file written at {0}")]
    Missing(PathBuf),

    #[error("malformed status record at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("status record names task {found:?}, expected {expected:?}")]
    TaskMismatch { expected: String, found: String },

    #[error("status record schema version {0} is newer than this orchestrator understands")]
    FutureSchema(u32),

    #[error("failed to read status record at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Remove any stale record so the next read observes only this invocation's
/// output. Missing files are fine.
pub fn clear(workdir: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(record_path(workdir)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read and validate the record for one finished invocation.
pub fn read(workdir: &Path, expected_task_id: &str) -> Result<CompletionRecord, CompletionError> {
    let path = record_path(workdir);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CompletionError::Missing(path));
        }
        Err(source) => return Err(CompletionError::Io { path, source }),
    };

    let record: CompletionRecord =
        serde_json::from_str(&content).map_err(|source| CompletionError::Malformed {
            path: path.clone(),
            source,
        })?;

    if record.schema_version > SCHEMA_VERSION {
        return Err(CompletionError::FutureSchema(record.schema_version));
    }
    if record.task_id != expected_task_id {
        return Err(CompletionError::TaskMismatch {
            expected: expected_task_id.to_owned(),
            found: record.task_id,
        });
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_record(dir: &Path, json: &str) {
        let path = record_path(dir);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, json).unwrap();
    }

    #[test]
    fn missing_record_reports_no_status_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = read(tmp.path(), "1.1").unwrap_err();
        assert!(matches!(err, CompletionError::Missing(_)));
    }

    #[test]
    fn well_formed_record_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        write_record(
            tmp.path(),
            r#"{
                "schema_version": 1,
                "task_id": "1.1",
                "status": "completed",
                "message": "all green",
                "timestamp": "2026-07-30T12:00:00Z",
                "plan_modified": true
            }"#,
        );
        let record = read(tmp.path(), "1.1").unwrap();
        assert_eq!(record.status, ReportedStatus::Completed);
        assert_eq!(record.message, "all green");
        assert!(record.plan_modified);
    }

    #[test]
    fn malformed_json_is_protocol_violation() {
        let tmp = tempfile::tempdir().unwrap();
        write_record(tmp.path(), "{not json");
        let err = read(tmp.path(), "1.1").unwrap_err();
        assert!(matches!(err, CompletionError::Malformed { .. }));
    }

    #[test]
    fn task_id_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_record(
            tmp.path(),
            r#"{"task_id": "9.9", "status": "completed", "timestamp": "2026-07-30T12:00:00Z"}"#,
        );
        let err = read(tmp.path(), "1.1").unwrap_err();
        assert!(matches!(err, CompletionError::TaskMismatch { .. }));
    }

    #[test]
    fn future_schema_version_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_record(
            tmp.path(),
            r#"{"schema_version": 99, "task_id": "1.1", "status": "completed", "timestamp": "2026-07-30T12:00:00Z"}"#,
        );
        let err = read(tmp.path(), "1.1").unwrap_err();
        assert!(matches!(err, CompletionError::FutureSchema(99)));
    }

    #[test]
    fn suspended_record_carries_question() {
        let tmp = tempfile::tempdir().unwrap();
        write_record(
            tmp.path(),
            r#"{
                "task_id": "1.1",
                "status": "suspended",
                "message": "need input",
                "timestamp": "2026-07-30T12:00:00Z",
                "question": {"text": "which port?", "context": "two configs disagree"}
            }"#,
        );
        let record = read(tmp.path(), "1.1").unwrap();
        assert_eq!(record.status, ReportedStatus::Suspended);
        assert_eq!(record.question.unwrap().text, "which port?");
    }

    #[test]
    fn clear_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        clear(tmp.path()).unwrap();
        write_record(
            tmp.path(),
            r#"{"task_id": "1.1", "status": "failed", "timestamp": "2026-07-30T12:00:00Z"}"#,
        );
        clear(tmp.path()).unwrap();
        clear(tmp.path()).unwrap();
        assert!(matches!(read(tmp.path(), "1.1"), Err(CompletionError::Missing(_))));
    }
}
