//! Per-plan token usage accounting.
//!
//! Usage is extracted opportunistically from agent output; collection never
//! blocks progress, and an agent that reports nothing simply contributes
//! nothing.

use std::collections::BTreeMap;
use std::fmt;

/// Token counts from a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UsageSample {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Option<f64>,
}

impl UsageSample {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost_usd.is_none()
    }

    /// Merge another sample into this one.
    pub fn absorb(&mut self, other: UsageSample) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd = match (self.cost_usd, other.cost_usd) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

/// Accumulated usage across one plan run.
#[derive(Debug, Clone, Default)]
pub struct PlanUsage {
    pub invocations: u32,
    pub total: UsageSample,
    pub per_task: BTreeMap<String, UsageSample>,
}

impl PlanUsage {
    /// Record the sample from one invocation of one task.
    pub fn record(&mut self, task_id: &str, sample: UsageSample) {
        self.invocations += 1;
        if sample.is_empty() {
            return;
        }
        self.total.absorb(sample);
        self.per_task.entry(task_id.to_owned()).or_default().absorb(sample);
    }
}

impl fmt::Display for PlanUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} invocations, {} in / {} out tokens",
            self.invocations, self.total.input_tokens, self.total.output_tokens
        )?;
        if let Some(cost) = self.total.cost_usd {
            write!(f, ", ${cost:.2}")?;
        }
        Ok(())
    }
}
