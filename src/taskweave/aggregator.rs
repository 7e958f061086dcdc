//! Result aggregation: compose per-subtask outputs into the final artifact.
//!
//! Output ordering always follows the plan, never completion time. Three
//! formats are supported: `summary` (headed concatenation), `detailed` (full
//! per-subtask blocks, the default), and `json` (a structured envelope whose
//! per-subtask entries round-trip losslessly).

use serde_json::json;
use std::collections::HashMap;

use crate::taskweave::plan::Plan;
use crate::taskweave::task::{SubtaskResult, SubtaskState};

/// Output shape of [`aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFormat {
    /// Concatenation with headings.
    Summary,
    /// Full per-subtask blocks. The default.
    Detailed,
    /// Structured JSON envelope: plan, per-subtask entries, aggregate counts.
    Json,
}

impl AggregateFormat {
    /// Parse a wire name (`summary` / `detailed` / `json`), defaulting to
    /// detailed.
    pub fn parse(name: &str) -> AggregateFormat {
        match name {
            "summary" => AggregateFormat::Summary,
            "json" => AggregateFormat::Json,
            _ => AggregateFormat::Detailed,
        }
    }
}

impl Default for AggregateFormat {
    fn default() -> Self {
        AggregateFormat::Detailed
    }
}

/// Compose the final artifact from subtask results, ordered by the plan.
pub fn aggregate(plan: &Plan, results: &[SubtaskResult], format: AggregateFormat) -> String {
    let ordered = order_by_plan(plan, results);
    match format {
        AggregateFormat::Summary => summary(&ordered),
        AggregateFormat::Detailed => detailed(&ordered),
        AggregateFormat::Json => json_envelope(plan, &ordered),
    }
}

/// Re-order results to match plan stage order.
fn order_by_plan<'a>(plan: &Plan, results: &'a [SubtaskResult]) -> Vec<&'a SubtaskResult> {
    let by_id: HashMap<&str, &SubtaskResult> =
        results.iter().map(|r| (r.subtask_id.as_str(), r)).collect();
    let mut ordered: Vec<&SubtaskResult> = Vec::with_capacity(results.len());
    for stage in &plan.stages {
        for id in stage {
            if let Some(result) = by_id.get(id.as_str()) {
                ordered.push(result);
            }
        }
    }
    // Results that the plan does not know about (degenerate records) come last.
    for result in results {
        if !plan.stages.iter().any(|s| s.contains(&result.subtask_id)) {
            ordered.push(result);
        }
    }
    ordered
}

fn summary(results: &[&SubtaskResult]) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&format!("## {}\n\n", result.description));
        match (&result.output, &result.failure_reason) {
            (Some(output), _) => out.push_str(output),
            (None, Some(reason)) => out.push_str(&format!("(failed: {})", reason)),
            (None, None) => out.push_str("(no output)"),
        }
        out.push_str("\n\n");
    }
    out.trim_end().to_string()
}

fn detailed(results: &[&SubtaskResult]) -> String {
    let mut out = String::new();
    let skipped: Vec<&str> = results
        .iter()
        .filter(|r| r.state == SubtaskState::Failed)
        .map(|r| r.description.as_str())
        .collect();

    for result in results {
        out.push_str(&format!(
            "## {} [{} | {}]\n\n",
            result.description, result.domain, result.state
        ));
        if let Some(score) = result.score {
            out.push_str(&format!("score: {:.2}\n", score));
        }
        if let Some(ms) = result.duration_ms {
            out.push_str(&format!("duration: {} ms\n", ms));
        }
        match (&result.output, &result.failure_reason) {
            (Some(output), _) => {
                out.push('\n');
                out.push_str(output);
            }
            (None, Some(reason)) => out.push_str(&format!("\nfailed: {}", reason)),
            (None, None) => out.push_str("\n(no output)"),
        }
        out.push_str("\n\n");
    }

    if !skipped.is_empty() {
        out.push_str("## Not completed\n\n");
        for description in skipped {
            out.push_str(&format!("- {}\n", description));
        }
    }
    out.trim_end().to_string()
}

fn json_envelope(plan: &Plan, results: &[&SubtaskResult]) -> String {
    let completed = results
        .iter()
        .filter(|r| r.state == SubtaskState::Completed)
        .count();
    let failed = results
        .iter()
        .filter(|r| r.state == SubtaskState::Failed)
        .count();
    let envelope = json!({
        "plan": plan,
        "subtasks": results,
        "aggregate": {
            "total": results.len(),
            "completed": completed,
            "failed": failed,
        },
    });
    serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| "{}".to_string())
}
