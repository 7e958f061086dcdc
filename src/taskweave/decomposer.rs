//! Template-guided task decomposition.
//!
//! Simple tasks pass through as a single subtask. Anything else is broken
//! down one of two ways:
//!
//! - **Explicit sequences.** Text carrying `and then` joints or a numbered
//!   list is split verbatim into a sequential chain — the caller already told
//!   us the steps.
//! - **Domain templates.** Otherwise each detected domain contributes its
//!   template steps (development → design/implement/test, devops →
//!   provision/configure/deploy/verify, …). Cross-domain merges interleave
//!   round-robin in the order the analyzer reported the domains, while the
//!   dependency chains stay per-domain so independent templates can run in
//!   parallel.
//!
//! An optional LLM refinement pass rewrites the step descriptions with the
//! task's specifics substituted in. Refinement may not add, remove, or
//! reorder steps — a response with the wrong line count is discarded, as is
//! any refinement error or timeout, in which case the template descriptions
//! are used verbatim.

use std::time::Duration;

use crate::taskweave::analyzer::Analysis;
use crate::taskweave::error::{EngineError, EngineResult};
use crate::taskweave::feedback::DelegationOptimizer;
use crate::taskweave::inference::{ChatMessage, GenerationOptions, InferenceClient, TaskClass};
use crate::taskweave::task::{Complexity, Domain, Subtask, Task};

/// How long the refinement call may take before the templates win.
pub const REFINEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Decomposition output: the subtasks plus the chains the templates (or the
/// explicit sequence) induced. The dependency mapper turns chain adjacency
/// into prerequisite edges.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub subtasks: Vec<Subtask>,
    /// Subtask ids in execution order, one chain per template / sequence.
    pub chains: Vec<Vec<String>>,
}

/// Template steps per domain, in execution order.
pub fn template_steps(domain: Domain) -> &'static [&'static str] {
    match domain {
        Domain::Development => &[
            "Design the approach",
            "Implement the solution",
            "Test the implementation",
        ],
        Domain::Devops => &[
            "Provision the infrastructure",
            "Configure the environment",
            "Deploy the release",
            "Verify the deployment",
        ],
        Domain::Data => &["Collect the data", "Transform and clean", "Analyze and report"],
        Domain::Research => &[
            "Survey existing work",
            "Investigate in depth",
            "Synthesize findings",
        ],
        Domain::Design => &["Draft the design", "Refine and finalize"],
        Domain::Testing => &["Plan the test cases", "Execute the tests", "Report the results"],
        Domain::Security => &["Audit the surface", "Harden weak points", "Verify the fixes"],
        Domain::Other => &["Investigate the request", "Resolve and summarize"],
    }
}

/// Produce the subtasks for a task.
///
/// `client` is only consulted for the description-refinement pass; a backend
/// failure there never fails the decomposition.
pub async fn decompose(
    task: &Task,
    analysis: &Analysis,
    client: &dyn InferenceClient,
    optimizer: &DelegationOptimizer,
) -> EngineResult<Decomposition> {
    let mut decomposition = if analysis.complexity == Complexity::Simple {
        let subtask = Subtask::new(&task.id, &task.text, task.dominant_domain());
        let chain = vec![subtask.id.clone()];
        Decomposition {
            subtasks: vec![subtask],
            chains: vec![chain],
        }
    } else {
        let steps = split_sequence(&task.text);
        if steps.len() >= 2 {
            sequence_decomposition(task, steps)
        } else {
            template_decomposition(task, analysis)
        }
    };

    if decomposition.subtasks.is_empty() {
        return Err(EngineError::Decomposition("empty decomposition".into()));
    }

    if analysis.requires_decomposition && decomposition.subtasks.len() > 1 {
        refine_descriptions(task, &mut decomposition.subtasks, client).await;
    }

    for subtask in &mut decomposition.subtasks {
        subtask.suggested_persona_id = optimizer.recommend(subtask.domain, "").await;
    }

    Ok(decomposition)
}

fn sequence_decomposition(task: &Task, steps: Vec<String>) -> Decomposition {
    let mut subtasks = Vec::with_capacity(steps.len());
    let mut chain = Vec::with_capacity(steps.len());
    for step in steps {
        let analysis = crate::taskweave::analyzer::analyze(&step, &Default::default());
        let domain = match analysis.domains.first() {
            Some(Domain::Other) | None => task.dominant_domain(),
            Some(d) => *d,
        };
        let subtask = Subtask::new(&task.id, step, domain);
        chain.push(subtask.id.clone());
        subtasks.push(subtask);
    }
    Decomposition {
        subtasks,
        chains: vec![chain],
    }
}

fn template_decomposition(task: &Task, analysis: &Analysis) -> Decomposition {
    let mut subtasks = Vec::new();
    let mut chains: Vec<Vec<String>> = vec![Vec::new(); analysis.domains.len()];

    // Round-robin across the domain templates so the emitted order
    // interleaves, while each chain stays per-domain.
    let longest = analysis
        .domains
        .iter()
        .map(|d| template_steps(*d).len())
        .max()
        .unwrap_or(0);
    for step_idx in 0..longest {
        for (domain_idx, domain) in analysis.domains.iter().enumerate() {
            let steps = template_steps(*domain);
            if let Some(label) = steps.get(step_idx) {
                let description = format!("{} — {}", label, task.text);
                let subtask = Subtask::new(&task.id, description, *domain);
                chains[domain_idx].push(subtask.id.clone());
                subtasks.push(subtask);
            }
        }
    }

    Decomposition { subtasks, chains }
}

/// Split a task string along explicit sequence markers. Returns the parts in
/// order, or an empty vec when no usable sequence exists.
pub fn split_sequence(text: &str) -> Vec<String> {
    // Numbered lists take priority: one step per numbered line.
    let numbered: Vec<String> = text
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return None;
            }
            let rest = &trimmed[digits.len()..];
            let mut chars = rest.chars();
            match chars.next() {
                Some('.') | Some(')') => Some(chars.as_str().trim().to_string()),
                _ => None,
            }
        })
        .filter(|s| !s.is_empty())
        .collect();
    if numbered.len() >= 2 {
        return numbered;
    }

    // Otherwise split on "and then" joints. Offsets into the lowercased
    // text are only valid in the original when the byte lengths agree.
    let lower = text.to_lowercase();
    if lower.len() != text.len() {
        return Vec::new();
    }
    let marker = "and then";
    let mut parts = Vec::new();
    let mut start = 0;
    let mut from = 0;
    while let Some(pos) = lower[from..].find(marker) {
        let abs = from + pos;
        parts.push(text[start..abs].trim().to_string());
        start = abs + marker.len();
        from = start;
    }
    parts.push(text[start..].trim().to_string());

    let parts: Vec<String> = parts
        .into_iter()
        .map(|p| p.trim_matches(|c: char| c == ',' || c == '.' || c.is_whitespace()).to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() >= 2 {
        parts
    } else {
        Vec::new()
    }
}

/// Ask the model to substitute the task's specifics into the template
/// descriptions. Count mismatches, errors, and timeouts all leave the
/// drafts untouched.
async fn refine_descriptions(task: &Task, subtasks: &mut [Subtask], client: &dyn InferenceClient) {
    let mut prompt = String::from(
        "Rewrite each step description below so it names the specifics of the task. \
         Keep the same number of steps and the same order. \
         Answer with one numbered line per step and nothing else.\n\n",
    );
    prompt.push_str(&format!("Task: {}\n\nSteps:\n", task.text));
    for (i, subtask) in subtasks.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, subtask.description));
    }

    let messages = [ChatMessage::user(prompt)];
    let options = GenerationOptions::default();
    let call = client.chat(TaskClass::General, &messages, &options);
    let response = match tokio::time::timeout(REFINEMENT_TIMEOUT, call).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            log::warn!("description refinement failed, keeping templates: {}", e);
            return;
        }
        Err(_) => {
            log::warn!("description refinement timed out, keeping templates");
            return;
        }
    };

    let refined: Vec<String> = response
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return None;
            }
            let rest = &trimmed[digits.len()..];
            let mut chars = rest.chars();
            match chars.next() {
                Some('.') | Some(')') => Some(chars.as_str().trim().to_string()),
                _ => None,
            }
        })
        .filter(|s| !s.is_empty())
        .collect();

    // The refinement may only rewrite, never resize or reorder.
    if refined.len() != subtasks.len() {
        log::warn!(
            "refinement returned {} lines for {} steps, keeping templates",
            refined.len(),
            subtasks.len()
        );
        return;
    }
    for (subtask, description) in subtasks.iter_mut().zip(refined) {
        subtask.description = description;
    }
}
