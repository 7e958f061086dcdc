//! Core task model: tasks, subtasks, the subtask lifecycle, conversation
//! turns, and the persisted workflow record.
//!
//! A [`Task`] is the immutable unit of work submitted by a caller. The
//! decomposer breaks it into [`Subtask`]s, the tracker walks each subtask
//! through the [`SubtaskState`] machine, and the orchestrator condenses the
//! whole run into a [`WorkflowRecord`] that long-term memory persists.
//!
//! # Lifecycle
//!
//! ```text
//! pending ──► assigned ──► in_progress ──► completed
//!                                      └─► failed
//! ```
//!
//! `failed` is terminal; a retry is a brand new subtask.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::taskweave::plan::Plan;

/// Complexity class assigned by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// Closed domain vocabulary used for tagging tasks and routing personas.
///
/// A task may carry several domains (e.g. development + testing). Anything
/// that matches no keyword resolves to [`Domain::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Development,
    Devops,
    Data,
    Research,
    Design,
    Testing,
    Security,
    Other,
}

impl Domain {
    /// Every domain in the closed vocabulary, in canonical order.
    pub const ALL: [Domain; 8] = [
        Domain::Development,
        Domain::Devops,
        Domain::Data,
        Domain::Research,
        Domain::Design,
        Domain::Testing,
        Domain::Security,
        Domain::Other,
    ];

    /// Stable lowercase name, matching the wire and disk representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Development => "development",
            Domain::Devops => "devops",
            Domain::Data => "data",
            Domain::Research => "research",
            Domain::Design => "design",
            Domain::Testing => "testing",
            Domain::Security => "security",
            Domain::Other => "other",
        }
    }

    /// Parse a canonical lowercase name back into a variant.
    pub fn parse(name: &str) -> Option<Domain> {
        Domain::ALL.iter().copied().find(|d| d.as_str() == name)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work submitted by the caller. Immutable once created.
///
/// # Example
///
/// ```rust
/// use taskweave::task::{Complexity, Domain, Task};
/// use std::collections::BTreeMap;
///
/// let task = Task::new(
///     "t-1".to_string(),
///     "Build a REST API".to_string(),
///     BTreeMap::new(),
///     Complexity::Medium,
///     vec![Domain::Development],
/// );
/// assert_eq!(task.complexity, Complexity::Medium);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque unique identifier (caller-supplied or a fresh UUID).
    pub id: String,
    /// Original task text exactly as submitted.
    pub text: String,
    /// Optional structured context supplied with the request.
    pub context: BTreeMap<String, String>,
    /// Complexity class decided by the analyzer.
    pub complexity: Complexity,
    /// Domain tags in the order the analyzer reported them.
    pub domains: Vec<Domain>,
    /// When the task was submitted.
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: String,
        text: String,
        context: BTreeMap<String, String>,
        complexity: Complexity,
        domains: Vec<Domain>,
    ) -> Self {
        Self {
            id,
            text,
            context,
            complexity,
            domains,
            submitted_at: Utc::now(),
        }
    }

    /// The dominant domain is the first one the analyzer reported.
    pub fn dominant_domain(&self) -> Domain {
        self.domains.first().copied().unwrap_or(Domain::Other)
    }
}

/// Lifecycle state of a single subtask.
///
/// The only legal paths are prefixes of
/// `pending → assigned → in_progress → (completed | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl SubtaskState {
    /// Whether moving from `self` to `next` is a legal edge of the machine.
    ///
    /// # Example
    ///
    /// ```rust
    /// use taskweave::task::SubtaskState;
    ///
    /// assert!(SubtaskState::Pending.can_transition_to(SubtaskState::Assigned));
    /// assert!(!SubtaskState::Pending.can_transition_to(SubtaskState::Completed));
    /// assert!(!SubtaskState::Failed.can_transition_to(SubtaskState::Pending));
    /// ```
    pub fn can_transition_to(&self, next: SubtaskState) -> bool {
        matches!(
            (self, next),
            (SubtaskState::Pending, SubtaskState::Assigned)
                | (SubtaskState::Assigned, SubtaskState::InProgress)
                | (SubtaskState::InProgress, SubtaskState::Completed)
                | (SubtaskState::InProgress, SubtaskState::Failed)
                // A subtask can be failed before dispatch when an upstream
                // prerequisite failed and it will never run.
                | (SubtaskState::Pending, SubtaskState::Failed)
        )
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubtaskState::Completed | SubtaskState::Failed)
    }
}

impl fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubtaskState::Pending => "pending",
            SubtaskState::Assigned => "assigned",
            SubtaskState::InProgress => "in_progress",
            SubtaskState::Completed => "completed",
            SubtaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A leaf unit produced by decomposition.
///
/// Prerequisites always reference subtasks of the same parent task; the
/// induced graph is acyclic (the mapper refuses anything else).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    /// Id of the parent [`Task`].
    pub task_id: String,
    /// What this subtask should accomplish.
    pub description: String,
    /// Domain tag routing persona selection and model choice.
    pub domain: Domain,
    /// Ids of subtasks that must complete before this one starts.
    pub prerequisites: Vec<String>,
    /// Persona recommended by the delegation optimizer, if any.
    pub suggested_persona_id: Option<String>,
    pub state: SubtaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when an agent is dispatched onto this subtask.
    pub agent_id: Option<String>,
    /// Final output text, set on success.
    pub output: Option<String>,
    /// Failure reason, set on failure.
    pub failure_reason: Option<String>,
}

impl Subtask {
    /// Create a fresh pending subtask under the given parent task.
    pub fn new(task_id: impl Into<String>, description: impl Into<String>, domain: Domain) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            description: description.into(),
            domain,
            prerequisites: Vec::new(),
            suggested_persona_id: None,
            state: SubtaskState::Pending,
            started_at: None,
            completed_at: None,
            agent_id: None,
            output: None,
            failure_reason: None,
        }
    }
}

/// Terminal status of a whole workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Every subtask completed.
    Ok,
    /// At least one subtask failed; siblings completed normally.
    Partial,
    /// The workflow was cancelled or timed out before finishing.
    Cancelled,
}

/// Per-subtask entry inside a [`WorkflowRecord`], ordered by plan position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub subtask_id: String,
    pub description: String,
    pub domain: Domain,
    pub state: SubtaskState,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
    /// Outcome-evaluator score in `[0, 1]`, when the subtask ran.
    pub score: Option<f64>,
    pub duration_ms: Option<u64>,
}

/// Wall-clock breakdown of one workflow run, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowTimings {
    pub total_ms: u64,
    pub analysis_ms: u64,
    pub planning_ms: u64,
    pub dispatch_ms: u64,
    pub aggregation_ms: u64,
}

/// The persisted outcome of one top-level task. Append-only once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub task_id: String,
    pub task_text: String,
    pub status: WorkflowStatus,
    pub plan: Plan,
    /// Subtask results in plan order, not completion order.
    pub results: Vec<SubtaskResult>,
    /// The aggregated final artifact.
    pub aggregated: String,
    pub timings: WorkflowTimings,
    pub completed_at: DateTime<Utc>,
}

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One conversational turn held in the short-term memory FIFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use SubtaskState::*;
        let legal = [
            (Pending, Assigned),
            (Assigned, InProgress),
            (InProgress, Completed),
            (InProgress, Failed),
            (Pending, Failed),
        ];
        for (from, to) in legal {
            assert!(from.can_transition_to(to), "{} -> {} should be legal", from, to);
        }
        let illegal = [
            (Pending, InProgress),
            (Pending, Completed),
            (Assigned, Completed),
            (Assigned, Pending),
            (Completed, Failed),
            (Failed, Pending),
            (Completed, Pending),
        ];
        for (from, to) in illegal {
            assert!(!from.can_transition_to(to), "{} -> {} should be illegal", from, to);
        }
    }

    #[test]
    fn test_domain_round_trip() {
        for d in Domain::ALL {
            assert_eq!(Domain::parse(d.as_str()), Some(d));
        }
        assert_eq!(Domain::parse("kernel"), None);
    }

    #[test]
    fn test_dominant_domain_defaults_to_other() {
        let task = Task::new(
            "t".into(),
            "hello".into(),
            Default::default(),
            Complexity::Simple,
            vec![],
        );
        assert_eq!(task.dominant_domain(), Domain::Other);
    }
}
