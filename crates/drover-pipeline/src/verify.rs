//! Post-execution verification of defect work items.
//!
//! A read-only verification agent checks whether the reported symptom is
//! actually gone and answers with a verdict line plus findings. The
//! findings are appended to the work item as a `## Verification #N`
//! section, so the history of attempts travels with the item.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use drover_core::invoker::PermissionProfile;

use crate::agent::TextAgent;
use crate::workitem::WorkItem;

/// Verification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    /// A passing or warning verdict lets the item archive; only FAIL loops.
    pub fn accepts(self) -> bool {
        matches!(self, Self::Pass | Self::Warn)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

impl FromStr for Verdict {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASS" => Ok(Self::Pass),
            "WARN" => Ok(Self::Warn),
            "FAIL" => Ok(Self::Fail),
            _ => Err(()),
        }
    }
}

/// Verdict plus the findings block for the work item file.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub verdict: Verdict,
    pub findings: String,
}

const VERIFICATION_PROMPT: &str = r#"You are verifying whether a reported defect is actually fixed.
Inspect the codebase and run the test suite as needed (you have no write
access). Re-read the defect report below, then check whether the reported
symptom is gone.

Answer with a first line of exactly `VERDICT: PASS`, `VERDICT: WARN`, or
`VERDICT: FAIL`, followed by your findings:
- PASS: the symptom is gone and nothing regressed.
- WARN: the symptom is gone but something adjacent deserves attention.
- FAIL: the symptom is still present, or the fix introduced a regression.

Defect report:
"#;

/// Run the verification agent against a defect item.
///
/// The agent runs read-only and on the fixed validator model -- verification
/// never participates in model escalation. Output without a verdict line is
/// treated as FAIL: an unreadable verdict must not archive the item as
/// verified.
pub async fn run_verification(
    agent: &dyn TextAgent,
    item: &WorkItem,
    validator_model: &str,
) -> Result<VerificationReport> {
    let output = agent
        .complete(
            &format!("{VERIFICATION_PROMPT}{}", item.body),
            PermissionProfile::Verify,
            Some(validator_model),
        )
        .await?;

    Ok(parse_report(&output))
}

fn parse_report(output: &str) -> VerificationReport {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("VERDICT:") {
            if let Ok(verdict) = rest.parse::<Verdict>() {
                let findings = output
                    .lines()
                    .skip_while(|l| l.trim() != trimmed)
                    .skip(1)
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim()
                    .to_owned();
                return VerificationReport { verdict, findings };
            }
        }
    }
    VerificationReport {
        verdict: Verdict::Fail,
        findings: format!("verifier produced no verdict line; raw output:\n{}", output.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedAgent;
    use crate::workitem::WorkItemKind;
    use std::path::Path;

    fn item(dir: &Path) -> WorkItem {
        let path = dir.join("001-bug.md");
        std::fs::write(&path, "# Bug\n\nStatus: Open\n\nCrash on save.\n").unwrap();
        WorkItem::load(&path, WorkItemKind::Defect).unwrap()
    }

    #[tokio::test]
    async fn pass_verdict_with_findings() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = ScriptedAgent::new(vec![
            "VERDICT: PASS\n\nRan the suite twice; save path no longer crashes.",
        ]);
        let report = run_verification(&agent, &item(tmp.path()), "validator-1").await.unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
        assert!(report.findings.contains("no longer crashes"));
        assert!(report.verdict.accepts());
    }

    #[tokio::test]
    async fn fail_verdict_loops() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = ScriptedAgent::new(vec!["VERDICT: FAIL\nStill reproduces with a large file."]);
        let report = run_verification(&agent, &item(tmp.path()), "validator-1").await.unwrap();
        assert_eq!(report.verdict, Verdict::Fail);
        assert!(!report.verdict.accepts());
    }

    #[test]
    fn missing_verdict_line_fails_closed() {
        let report = parse_report("I looked around and everything seems fine I guess?");
        assert_eq!(report.verdict, Verdict::Fail);
        assert!(report.findings.contains("no verdict line"));
    }

    #[test]
    fn verdict_parsing_is_case_tolerant() {
        assert_eq!("pass".parse::<Verdict>().unwrap(), Verdict::Pass);
        assert_eq!(" WARN ".parse::<Verdict>().unwrap(), Verdict::Warn);
        assert!("maybe".parse::<Verdict>().is_err());
    }

    #[test]
    fn warn_verdict_accepts() {
        let report = parse_report("VERDICT: WARN\nFixed, but the test is slow.");
        assert_eq!(report.verdict, Verdict::Warn);
        assert!(report.verdict.accepts());
        assert_eq!(report.findings, "Fixed, but the test is slow.");
    }
}
