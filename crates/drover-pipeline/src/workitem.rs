//! Work items: markdown files in typed backlog directories.
//!
//! The header block is parsed leniently -- real items are written by humans
//! and by LLMs, so field extraction tolerates bold markers and stray
//! whitespace. The file's location is the canonical lifecycle state; the
//! `Status:` header is metadata that travels with the file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// Backlog item categories, in processing-priority order: defects are
/// handled before features, features before analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkItemKind {
    Defect,
    Feature,
    Analysis,
}

impl WorkItemKind {
    pub const ALL: [WorkItemKind; 3] = [Self::Defect, Self::Feature, Self::Analysis];

    /// Backlog/archive directory name for this kind.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Defect => "defects",
            Self::Feature => "features",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for WorkItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for WorkItemKind {
    type Err = WorkItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "defect" | "defects" | "bug" => Ok(Self::Defect),
            "feature" | "features" => Ok(Self::Feature),
            "analysis" => Ok(Self::Analysis),
            other => Err(WorkItemError::UnknownKind(other.to_owned())),
        }
    }
}

/// Status header values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItemStatus {
    Open,
    NeedsClarification,
    Completed,
    Fixed,
    /// `Archived (...)` with the parenthesised reason preserved.
    Archived(String),
}

impl WorkItemStatus {
    /// Terminal statuses must not sit in an active backlog directory.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Fixed | Self::Archived(_))
    }

    /// Header text for rewriting the status line.
    pub fn header_value(&self) -> String {
        match self {
            Self::Open => "Open".to_owned(),
            Self::NeedsClarification => "Needs Clarification".to_owned(),
            Self::Completed => "Completed".to_owned(),
            Self::Fixed => "Fixed".to_owned(),
            Self::Archived(reason) => format!("Archived ({reason})"),
        }
    }

    fn parse(value: &str) -> Self {
        let v = value.trim();
        let lower = v.to_ascii_lowercase();
        if lower == "open" {
            Self::Open
        } else if lower == "needs clarification" {
            Self::NeedsClarification
        } else if lower == "completed" {
            Self::Completed
        } else if lower == "fixed" {
            Self::Fixed
        } else if lower.starts_with("archived") {
            let reason = v
                .find('(')
                .and_then(|start| v.rfind(')').map(|end| &v[start + 1..end]))
                .unwrap_or("")
                .to_owned();
            Self::Archived(reason)
        } else {
            // Unrecognized values keep the item active.
            Self::Open
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkItemError {
    #[error("unknown work item kind: {0:?}")]
    UnknownKind(String),

    #[error("failed to read work item at {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write work item at {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One work request.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub path: PathBuf,
    pub slug: String,
    pub kind: WorkItemKind,
    pub status: WorkItemStatus,
    pub dependencies: Vec<String>,
    /// Full file text.
    pub body: String,
}

/// Header lines are searched within this prefix of the file.
const HEADER_SCAN_LINES: usize = 25;

impl WorkItem {
    /// Parse a work item file.
    pub fn load(path: &Path, kind: WorkItemKind) -> Result<Self, WorkItemError> {
        let body = std::fs::read_to_string(path).map_err(|source| WorkItemError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let slug = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let status = header_field(&body, "Status")
            .map(|v| WorkItemStatus::parse(&v))
            .unwrap_or(WorkItemStatus::Open);

        let dependencies = header_field(&body, "Dependencies")
            .map(|v| {
                v.split(',')
                    .map(|d| d.trim().trim_end_matches(".md").to_owned())
                    .filter(|d| !d.is_empty() && d.to_ascii_lowercase() != "none")
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            slug,
            kind,
            status,
            dependencies,
            body,
        })
    }

    /// Leading numeric portion of the slug, used for backlog ordering.
    pub fn numeric_prefix(&self) -> Option<u64> {
        let digits: String = self.slug.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }

    /// Number of verification sections already recorded in the file. This
    /// count survives process restarts, so the verification-cycle bound
    /// holds across crashes.
    pub fn verification_count(&self) -> u32 {
        self.body
            .lines()
            .filter(|l| l.trim_start().starts_with("## Verification #"))
            .count() as u32
    }

    /// Rewrite (or insert) the `Status:` header line, atomically.
    pub fn rewrite_status(&mut self, status: WorkItemStatus) -> Result<(), WorkItemError> {
        let header = status.header_value();
        let mut replaced = false;
        let mut lines: Vec<String> = self
            .body
            .lines()
            .map(|line| {
                if !replaced && is_header_line(line, "Status") {
                    replaced = true;
                    format!("Status: {header}")
                } else {
                    line.to_owned()
                }
            })
            .collect();

        if !replaced {
            // Insert after the title line, or at the top of an untitled file.
            let at = usize::from(lines.first().is_some_and(|l| l.starts_with('#')));
            lines.insert(at, format!("Status: {header}"));
        }

        self.body = lines.join("\n");
        if !self.body.ends_with('\n') {
            self.body.push('\n');
        }
        self.status = status;
        self.write_atomic()
    }

    /// Append a `## Verification #N` section with the verdict and findings.
    pub fn append_verification(
        &mut self,
        verdict: &str,
        findings: &str,
    ) -> Result<u32, WorkItemError> {
        let n = self.verification_count() + 1;
        let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        if !self.body.ends_with('\n') {
            self.body.push('\n');
        }
        self.body.push_str(&format!(
            "\n## Verification #{n}\n\nVerdict: {verdict}\nChecked: {ts}\n\n{}\n",
            findings.trim()
        ));
        self.write_atomic()?;
        Ok(n)
    }

    fn write_atomic(&self) -> Result<(), WorkItemError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let to_err = |source: std::io::Error| WorkItemError::Write {
            path: self.path.clone(),
            source,
        };
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(to_err)?;
        std::fs::write(tmp.path(), &self.body).map_err(to_err)?;
        tmp.persist(&self.path).map_err(|e| to_err(e.error))?;
        Ok(())
    }
}

/// Extract a `Name: value` header field from the top of the file, tolerating
/// `**Name:** value` bold markers.
fn header_field(body: &str, name: &str) -> Option<String> {
    body.lines()
        .take(HEADER_SCAN_LINES)
        .find(|line| is_header_line(line, name))
        .map(|line| {
            let cleaned = line.replace("**", "");
            cleaned
                .splitn(2, ':')
                .nth(1)
                .map(|v| v.trim().to_owned())
                .unwrap_or_default()
        })
}

fn is_header_line(line: &str, name: &str) -> bool {
    let cleaned = line.replace("**", "");
    let trimmed = cleaned.trim_start();
    trimmed
        .strip_prefix(name)
        .is_some_and(|rest| rest.trim_start().starts_with(':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_item(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_header_fields_leniently() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_item(
            tmp.path(),
            "012-crash-on-save.md",
            "# Crash on save\n\n**Status:** Needs Clarification\nDependencies: 010-refactor, 011-io.md\n\nDetails...\n",
        );
        let item = WorkItem::load(&path, WorkItemKind::Defect).unwrap();
        assert_eq!(item.slug, "012-crash-on-save");
        assert_eq!(item.status, WorkItemStatus::NeedsClarification);
        assert_eq!(item.dependencies, vec!["010-refactor", "011-io"]);
        assert_eq!(item.numeric_prefix(), Some(12));
    }

    #[test]
    fn missing_status_defaults_to_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_item(tmp.path(), "001-idea.md", "# An idea\n\nJust text.\n");
        let item = WorkItem::load(&path, WorkItemKind::Feature).unwrap();
        assert_eq!(item.status, WorkItemStatus::Open);
        assert!(item.dependencies.is_empty());
    }

    #[test]
    fn archived_status_preserves_reason() {
        let status = WorkItemStatus::parse("Archived (verification failed)");
        assert_eq!(status, WorkItemStatus::Archived("verification failed".to_owned()));
        assert!(status.is_terminal());
        assert_eq!(status.header_value(), "Archived (verification failed)");
    }

    #[test]
    fn rewrite_status_replaces_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_item(
            tmp.path(),
            "002-bug.md",
            "# Bug\n\nStatus: Open\n\nBody.\n",
        );
        let mut item = WorkItem::load(&path, WorkItemKind::Defect).unwrap();
        item.rewrite_status(WorkItemStatus::Archived("verification failed".to_owned()))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Status: Archived (verification failed)"));
        assert_eq!(text.matches("Status:").count(), 1);
    }

    #[test]
    fn rewrite_status_inserts_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_item(tmp.path(), "003-bare.md", "# Bare item\n\nText.\n");
        let mut item = WorkItem::load(&path, WorkItemKind::Defect).unwrap();
        item.rewrite_status(WorkItemStatus::Completed).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Bare item\nStatus: Completed\n"));
    }

    #[test]
    fn verification_sections_accumulate_and_count() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_item(tmp.path(), "004-bug.md", "# Bug\n\nStatus: Open\n");
        let mut item = WorkItem::load(&path, WorkItemKind::Defect).unwrap();

        assert_eq!(item.verification_count(), 0);
        assert_eq!(item.append_verification("FAIL", "symptom persists").unwrap(), 1);
        assert_eq!(item.append_verification("FAIL", "still broken").unwrap(), 2);

        let reloaded = WorkItem::load(&path, WorkItemKind::Defect).unwrap();
        assert_eq!(reloaded.verification_count(), 2);
        assert!(reloaded.body.contains("## Verification #2"));
        assert!(reloaded.body.contains("Verdict: FAIL"));
    }

    #[test]
    fn kind_ordering_puts_defects_first() {
        let mut kinds = vec![WorkItemKind::Analysis, WorkItemKind::Defect, WorkItemKind::Feature];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![WorkItemKind::Defect, WorkItemKind::Feature, WorkItemKind::Analysis]
        );
    }
}
