//! Run report: per-node outcomes for one execution pass.
//!
//! The report distinguishes `failed` (the command ran and errored) from
//! `blocked` (never attempted because an ancestor failed) so the true
//! root cause is one glance away.

use colored::Colorize;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Final outcome of one graph node in a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    Succeeded { duration_seconds: f64 },
    Skipped,
    Failed { error: String },
    Blocked { on: String },
    Cancelled,
}

/// Accumulated outcomes for one driver pass, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub manifest: String,
    pub run_id: String,
    pub nodes: IndexMap<String, NodeOutcome>,
    pub wall_seconds: f64,
}

impl RunReport {
    pub fn succeeded(&self) -> u32 {
        self.count(|o| matches!(o, NodeOutcome::Succeeded { .. }))
    }

    pub fn skipped(&self) -> u32 {
        self.count(|o| matches!(o, NodeOutcome::Skipped))
    }

    pub fn failed(&self) -> u32 {
        self.count(|o| matches!(o, NodeOutcome::Failed { .. }))
    }

    pub fn blocked(&self) -> u32 {
        self.count(|o| matches!(o, NodeOutcome::Blocked { .. }))
    }

    pub fn cancelled(&self) -> u32 {
        self.count(|o| matches!(o, NodeOutcome::Cancelled))
    }

    fn count(&self, pred: impl Fn(&NodeOutcome) -> bool) -> u32 {
        self.nodes.values().filter(|o| pred(o)).count() as u32
    }

    /// True when every node either ran to success or was fresh.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.blocked() == 0 && self.cancelled() == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Terminal rendering, one line per node plus a summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Run {} — {}\n", self.run_id, self.manifest.bold()));
        for (key, outcome) in &self.nodes {
            let line = match outcome {
                NodeOutcome::Succeeded { duration_seconds } => format!(
                    "  {:24} {} ({:.1}s)",
                    key,
                    "succeeded".green(),
                    duration_seconds
                ),
                NodeOutcome::Skipped => {
                    format!("  {:24} {}", key, "skipped".dimmed())
                }
                NodeOutcome::Failed { error } => {
                    format!("  {:24} {} — {}", key, "failed".red().bold(), error)
                }
                NodeOutcome::Blocked { on } => format!(
                    "  {:24} {} (ancestor '{}' failed)",
                    key,
                    "blocked".yellow(),
                    on
                ),
                NodeOutcome::Cancelled => {
                    format!("  {:24} {}", key, "cancelled".yellow())
                }
            };
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(&format!(
            "{} succeeded, {} skipped, {} failed, {} blocked ({:.1}s)\n",
            self.succeeded(),
            self.skipped(),
            self.failed(),
            self.blocked(),
            self.wall_seconds
        ));
        out
    }
}
