//! Intake: turn free-form text into a structured work item.
//!
//! An analysis agent must produce a title, a classification, and a
//! root-cause chain of exactly five "why?" steps. A short chain earns one
//! retry with the incomplete result as context; a still-short chain is
//! accepted with a warning rather than stalling the pipeline on a stubborn
//! model.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use drover_core::invoker::PermissionProfile;

use crate::agent::TextAgent;
use crate::layout::Layout;
use crate::workitem::{WorkItemKind, WorkItemStatus};

/// Required length of the root-cause chain.
pub const REQUIRED_WHYS: usize = 5;

/// Structured output contract for the analysis agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeAnalysis {
    pub title: String,
    /// "defect", "feature", or "analysis".
    pub classification: String,
    /// The five-why chain, outermost symptom first.
    #[serde(default)]
    pub root_cause_chain: Vec<String>,
}

/// Analysis plus whether the contract was ultimately satisfied.
#[derive(Debug, Clone)]
pub struct IntakeResult {
    pub analysis: IntakeAnalysis,
    /// False when the chain stayed short even after the retry.
    pub complete: bool,
}

const ANALYSIS_PROMPT: &str = r#"Analyze the work request below and answer with a single JSON
object, nothing else:

{
  "title": "<short imperative title>",
  "classification": "defect" | "feature" | "analysis",
  "root_cause_chain": ["why #1", "why #2", "why #3", "why #4", "why #5"]
}

The root_cause_chain must contain exactly five "why?" steps, starting from
the reported symptom and digging one level deeper each step. For feature
requests, chain the underlying motivations instead.

Work request:
"#;

const RETRY_PROMPT: &str = r#"Your previous analysis was incomplete: the root_cause_chain must
contain exactly five entries. Here is what you produced:

"#;

/// Run the analysis agent, enforcing the structured-output contract.
pub async fn analyze(agent: &dyn TextAgent, raw_text: &str) -> Result<IntakeResult> {
    let first = agent
        .complete(
            &format!("{ANALYSIS_PROMPT}{raw_text}"),
            PermissionProfile::ReadOnly,
            None,
        )
        .await?;
    let mut analysis = parse_analysis(&first)?;

    if analysis.root_cause_chain.len() >= REQUIRED_WHYS {
        return Ok(IntakeResult { analysis, complete: true });
    }

    // One structured retry, handing back the incomplete result as context.
    let incomplete = serde_json::to_string_pretty(&analysis)?;
    let second = agent
        .complete(
            &format!(
                "{RETRY_PROMPT}{incomplete}\n\nProduce the corrected JSON for this work request:\n{raw_text}"
            ),
            PermissionProfile::ReadOnly,
            None,
        )
        .await?;
    if let Ok(retried) = parse_analysis(&second) {
        if retried.root_cause_chain.len() >= analysis.root_cause_chain.len() {
            analysis = retried;
        }
    }

    let complete = analysis.root_cause_chain.len() >= REQUIRED_WHYS;
    if !complete {
        tracing::warn!(
            whys = analysis.root_cause_chain.len(),
            "analysis stayed short of five whys after retry, creating item anyway"
        );
    }
    Ok(IntakeResult { analysis, complete })
}

/// Create the work item file for an analysis. Returns its path.
pub fn write_work_item(
    layout: &Layout,
    result: &IntakeResult,
    raw_text: &str,
    default_kind: WorkItemKind,
) -> Result<PathBuf> {
    let kind = result
        .analysis
        .classification
        .parse::<WorkItemKind>()
        .unwrap_or(default_kind);

    let slug = next_slug(layout, kind, &result.analysis.title)?;
    let path = layout.backlog_dir(kind).join(format!("{slug}.md"));

    let mut body = String::new();
    body.push_str(&format!("# {}\n\n", result.analysis.title));
    body.push_str(&format!("Status: {}\n", WorkItemStatus::Open.header_value()));
    body.push_str("Dependencies: none\n\n");
    if !result.complete {
        body.push_str("> Warning: intake analysis stayed short of five whys.\n\n");
    }
    body.push_str("## Root Cause Chain\n\n");
    for (i, why) in result.analysis.root_cause_chain.iter().enumerate() {
        body.push_str(&format!("{}. {why}\n", i + 1));
    }
    body.push_str("\n## Original Request\n\n");
    body.push_str(raw_text.trim());
    body.push('\n');

    std::fs::create_dir_all(layout.backlog_dir(kind))?;
    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(slug = %slug, kind = %kind, "created work item");
    Ok(path)
}

/// Next slug for a kind: highest existing numeric prefix plus one, then the
/// kebab-cased title.
fn next_slug(layout: &Layout, kind: WorkItemKind, title: &str) -> Result<String> {
    let mut highest = 0u64;
    for dir in [layout.backlog_dir(kind), layout.archive_dir(kind)] {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
            if let Ok(n) = digits.parse::<u64>() {
                highest = highest.max(n);
            }
        }
    }
    Ok(format!("{:03}-{}", highest + 1, kebab(title)))
}

fn kebab(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-")
}

/// Pull the first JSON object out of agent output that may carry prose
/// around it.
fn parse_analysis(output: &str) -> Result<IntakeAnalysis> {
    let start = output.find('{').context("no JSON object in analysis output")?;
    let end = output.rfind('}').context("unterminated JSON object in analysis output")?;
    serde_json::from_str(&output[start..=end]).context("analysis output did not match the contract")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedAgent;

    fn full_json() -> &'static str {
        r#"{"title": "Fix crash on save", "classification": "defect",
            "root_cause_chain": ["save crashes", "buffer freed", "double free",
                                 "ownership unclear", "no RAII wrapper"]}"#
    }

    #[tokio::test]
    async fn complete_analysis_needs_no_retry() {
        let agent = ScriptedAgent::new(vec![full_json()]);
        let result = analyze(&agent, "the app crashes when saving").await.unwrap();
        assert!(result.complete);
        assert_eq!(result.analysis.root_cause_chain.len(), 5);
        assert_eq!(agent.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn short_chain_triggers_exactly_one_retry() {
        let short = r#"{"title": "Fix crash", "classification": "defect",
                        "root_cause_chain": ["save crashes", "buffer freed"]}"#;
        let agent = ScriptedAgent::new(vec![short, full_json()]);
        let result = analyze(&agent, "crash").await.unwrap();
        assert!(result.complete);
        assert_eq!(result.analysis.root_cause_chain.len(), 5);

        let prompts = agent.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("incomplete"), "retry carries the contract reminder");
        assert!(prompts[1].contains("buffer freed"), "retry carries the incomplete result");
    }

    #[tokio::test]
    async fn still_short_after_retry_proceeds_with_warning() {
        let short = r#"{"title": "Fix crash", "classification": "defect",
                        "root_cause_chain": ["save crashes"]}"#;
        let agent = ScriptedAgent::new(vec![short, short]);
        let result = analyze(&agent, "crash").await.unwrap();
        assert!(!result.complete);
        assert_eq!(result.analysis.root_cause_chain.len(), 1);
    }

    #[tokio::test]
    async fn prose_around_json_is_tolerated() {
        let wrapped = format!("Here is my analysis:\n\n{}\n\nHope that helps!", full_json());
        let agent = ScriptedAgent::new(vec![&wrapped]);
        let result = analyze(&agent, "crash").await.unwrap();
        assert_eq!(result.analysis.title, "Fix crash on save");
    }

    #[test]
    fn work_item_file_carries_contract_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        layout.ensure_dirs().unwrap();

        let result = IntakeResult {
            analysis: serde_json::from_str(full_json()).unwrap(),
            complete: true,
        };
        let path = write_work_item(&layout, &result, "raw report text", WorkItemKind::Defect)
            .unwrap();

        assert!(path.starts_with(layout.backlog_dir(WorkItemKind::Defect)));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Fix crash on save"));
        assert!(text.contains("Status: Open"));
        assert!(text.contains("## Root Cause Chain"));
        assert!(text.contains("raw report text"));
    }

    #[test]
    fn slugs_increment_past_existing_items() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        layout.ensure_dirs().unwrap();
        std::fs::write(
            layout.backlog_dir(WorkItemKind::Defect).join("007-old.md"),
            "# old\n",
        )
        .unwrap();

        let slug = next_slug(&layout, WorkItemKind::Defect, "New Crash! In Parser").unwrap();
        assert_eq!(slug, "008-new-crash-in-parser");
    }
}
