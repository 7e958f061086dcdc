//! The feedback loop: outcome evaluation and delegation optimization.
//!
//! Every finished subtask is scored on three axes in `[0, 1]` — quality
//! (does the output conform to the requested format?), completeness (does it
//! address the elements of the description?), and success (did it complete
//! rather than fail?). The overall score is the weighted mean
//! `0.4·quality + 0.3·completeness + 0.3·success`.
//!
//! The [`DelegationOptimizer`] folds these scores into each persona's
//! exponential moving average (α = 0.2, applied by the persona store) and
//! keeps per-domain duration statistics that the planner uses as critical
//! path weights. [`DelegationOptimizer::recommend`] biases future persona
//! selection toward proven performers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::taskweave::error::EngineResult;
use crate::taskweave::persona::{PersonaFilter, PersonaStore};
use crate::taskweave::task::{Domain, Subtask, SubtaskState};

/// Uses a persona needs before `recommend` will return it.
pub const MIN_USES_FOR_RECOMMENDATION: u64 = 3;

/// Axis scores for one finished subtask.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeScore {
    pub quality: f64,
    pub completeness: f64,
    pub success: f64,
    pub overall: f64,
}

/// Score a terminal subtask against the output format its persona requested.
pub fn evaluate(subtask: &Subtask, output_format: &BTreeMap<String, String>) -> OutcomeScore {
    let success = if subtask.state == SubtaskState::Completed {
        1.0
    } else {
        0.0
    };
    let output = subtask.output.as_deref().unwrap_or("");
    let quality = quality_score(output, output_format);
    let completeness = completeness_score(&subtask.description, output);
    let overall = 0.4 * quality + 0.3 * completeness + 0.3 * success;
    OutcomeScore {
        quality,
        completeness,
        success,
        overall,
    }
}

/// Format conformance. Empty output scores zero; otherwise a rubric of
/// cheap structural checks against the requested format entries.
fn quality_score(output: &str, output_format: &BTreeMap<String, String>) -> f64 {
    if output.trim().is_empty() {
        return 0.0;
    }
    if output_format.is_empty() {
        return 1.0;
    }
    let mut score: f64 = 1.0;
    for value in output_format.values() {
        let want = value.to_lowercase();
        if want.contains("json") && serde_json::from_str::<serde_json::Value>(output.trim()).is_err()
        {
            score -= 0.5;
        }
        if want.contains("markdown")
            && !(output.contains('#') || output.contains("- ") || output.contains("**"))
        {
            score -= 0.3;
        }
    }
    score.clamp(0.0, 1.0)
}

/// Keyword coverage: the fraction of significant description words that
/// reappear in the output.
fn completeness_score(description: &str, output: &str) -> f64 {
    let output_lower = output.to_lowercase();
    let significant: Vec<String> = description
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > 3)
        .collect();
    if significant.is_empty() {
        return if output.trim().is_empty() { 0.0 } else { 1.0 };
    }
    let covered = significant
        .iter()
        .filter(|w| output_lower.contains(w.as_str()))
        .count();
    covered as f64 / significant.len() as f64
}

#[derive(Debug, Clone, Copy, Default)]
struct DurationStat {
    total_ms: f64,
    samples: u64,
}

/// Learns which personas to delegate to, and how long work tends to take.
pub struct DelegationOptimizer {
    store: Arc<PersonaStore>,
    durations: RwLock<HashMap<Domain, DurationStat>>,
}

impl DelegationOptimizer {
    pub fn new(store: Arc<PersonaStore>) -> Self {
        Self {
            store,
            durations: RwLock::new(HashMap::new()),
        }
    }

    /// Fold a scored outcome back into the persona's EMA and the domain's
    /// duration statistics.
    pub async fn record_outcome(
        &self,
        persona_id: &str,
        domain: Domain,
        score: &OutcomeScore,
        duration_ms: Option<u64>,
    ) -> EngineResult<()> {
        self.store.record_use(persona_id, score.overall).await?;
        if let Some(ms) = duration_ms {
            let mut durations = self.durations.write().await;
            let stat = durations.entry(domain).or_default();
            stat.total_ms += ms as f64;
            stat.samples += 1;
        }
        Ok(())
    }

    /// Highest-scoring persona for a domain (optionally narrowed by a role
    /// hint) with at least [`MIN_USES_FOR_RECOMMENDATION`] uses. `None` tells
    /// the orchestrator to fall back to a fresh persona-store match.
    pub async fn recommend(&self, domain: Domain, role_hint: &str) -> Option<String> {
        let filter = PersonaFilter {
            domain: Some(domain.as_str().to_string()),
            min_uses: Some(MIN_USES_FOR_RECOMMENDATION),
        };
        let candidates = self.store.list(&filter).await;
        let hint = role_hint.to_lowercase();
        candidates
            .into_iter()
            .find(|record| hint.is_empty() || record.dna.role.to_lowercase().contains(&hint))
            .map(|record| record.id)
    }

    /// Mean observed duration for a domain, in milliseconds, once at least
    /// [`MIN_USES_FOR_RECOMMENDATION`] samples exist.
    pub async fn mean_duration_ms(&self, domain: Domain) -> Option<f64> {
        let durations = self.durations.read().await;
        durations.get(&domain).and_then(|stat| {
            if stat.samples >= MIN_USES_FOR_RECOMMENDATION {
                Some(stat.total_ms / stat.samples as f64)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_subtask(description: &str, output: &str) -> Subtask {
        let mut s = Subtask::new("t", description, Domain::Development);
        s.state = SubtaskState::Completed;
        s.output = Some(output.to_string());
        s
    }

    #[test]
    fn test_failed_subtask_scores_zero_success() {
        let mut s = Subtask::new("t", "do something", Domain::Development);
        s.state = SubtaskState::Failed;
        let score = evaluate(&s, &BTreeMap::new());
        assert_eq!(score.success, 0.0);
        assert_eq!(score.quality, 0.0);
        assert!(score.overall < 0.5);
    }

    #[test]
    fn test_covering_output_scores_high() {
        let s = completed_subtask(
            "implement the login endpoint",
            "The login endpoint is implemented with JWT; endpoint tests pass.",
        );
        let score = evaluate(&s, &BTreeMap::new());
        assert_eq!(score.success, 1.0);
        assert!(score.completeness > 0.5, "completeness {}", score.completeness);
        assert!(score.overall > 0.7);
    }

    #[test]
    fn test_json_format_checked() {
        let mut format = BTreeMap::new();
        format.insert("style".to_string(), "json".to_string());
        let good = completed_subtask("emit json", r#"{"ok": true}"#);
        let bad = completed_subtask("emit json", "not json at all");
        assert!(
            evaluate(&good, &format).quality > evaluate(&bad, &format).quality
        );
    }
}
