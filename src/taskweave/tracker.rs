//! Per-task lifecycle tracking.
//!
//! The tracker exclusively owns subtask-state mutation: every transition
//! funnels through [`TaskTracker::transition`], which enforces the state
//! machine and stamps timings. Other components observe progress through the
//! message bus, never by mutating tracker state. Transitions are totally
//! ordered per subtask — the tracker serialises all writes behind one lock,
//! which subsumes the per-id ordering requirement.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::taskweave::error::{EngineError, EngineResult};
use crate::taskweave::plan::Plan;
use crate::taskweave::task::SubtaskState;

/// Tracked state of a single subtask.
#[derive(Debug, Clone)]
pub struct TrackedSubtask {
    pub state: SubtaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form detail attached to the last transition (failure reason).
    pub detail: Option<String>,
}

impl TrackedSubtask {
    /// Milliseconds between start and completion, when both are known.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Tracked state of a whole task.
#[derive(Debug, Clone)]
pub struct TrackedTask {
    pub task_id: String,
    pub plan: Plan,
    pub subtasks: HashMap<String, TrackedSubtask>,
    pub created_at: DateTime<Utc>,
}

impl TrackedTask {
    /// `(completed + failed) / total`, or 1.0 for an empty plan.
    pub fn overall_progress(&self) -> f64 {
        if self.subtasks.is_empty() {
            return 1.0;
        }
        let terminal = self
            .subtasks
            .values()
            .filter(|s| s.state.is_terminal())
            .count();
        terminal as f64 / self.subtasks.len() as f64
    }
}

/// The task-progress registry.
pub struct TaskTracker {
    inner: RwLock<TrackerInner>,
}

struct TrackerInner {
    tasks: HashMap<String, TrackedTask>,
    /// subtask id → owning task id.
    owners: HashMap<String, String>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TrackerInner {
                tasks: HashMap::new(),
                owners: HashMap::new(),
            }),
        }
    }

    /// Register a task and the subtasks its plan schedules, all `pending`.
    pub async fn create(&self, task_id: &str, plan: &Plan) {
        let mut inner = self.inner.write().await;
        let mut subtasks = HashMap::new();
        for stage in &plan.stages {
            for subtask_id in stage {
                subtasks.insert(
                    subtask_id.clone(),
                    TrackedSubtask {
                        state: SubtaskState::Pending,
                        started_at: None,
                        completed_at: None,
                        detail: None,
                    },
                );
                inner.owners.insert(subtask_id.clone(), task_id.to_string());
            }
        }
        inner.tasks.insert(
            task_id.to_string(),
            TrackedTask {
                task_id: task_id.to_string(),
                plan: plan.clone(),
                subtasks,
                created_at: Utc::now(),
            },
        );
    }

    /// Apply a state transition, enforcing the machine.
    ///
    /// Illegal transitions return [`EngineError::State`] — always a bug in
    /// the caller, logged before being handed back.
    pub async fn transition(
        &self,
        subtask_id: &str,
        new_state: SubtaskState,
        detail: Option<String>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        let task_id = inner
            .owners
            .get(subtask_id)
            .cloned()
            .ok_or_else(|| EngineError::State(format!("unknown subtask {}", subtask_id)))?;
        let tracked = inner
            .tasks
            .get_mut(&task_id)
            .and_then(|t| t.subtasks.get_mut(subtask_id))
            .ok_or_else(|| EngineError::State(format!("unknown subtask {}", subtask_id)))?;

        if !tracked.state.can_transition_to(new_state) {
            let err = EngineError::State(format!(
                "subtask {}: {} -> {}",
                subtask_id, tracked.state, new_state
            ));
            log::error!("{}", err);
            return Err(err);
        }

        match new_state {
            SubtaskState::InProgress => tracked.started_at = Some(Utc::now()),
            SubtaskState::Completed | SubtaskState::Failed => {
                tracked.completed_at = Some(Utc::now())
            }
            _ => {}
        }
        tracked.state = new_state;
        if detail.is_some() {
            tracked.detail = detail;
        }
        Ok(())
    }

    /// Snapshot a task's tracked state.
    pub async fn get(&self, task_id: &str) -> Option<TrackedTask> {
        self.inner.read().await.tasks.get(task_id).cloned()
    }

    /// Snapshot one subtask's tracked state.
    pub async fn get_subtask(&self, subtask_id: &str) -> Option<TrackedSubtask> {
        let inner = self.inner.read().await;
        let task_id = inner.owners.get(subtask_id)?;
        inner
            .tasks
            .get(task_id)
            .and_then(|t| t.subtasks.get(subtask_id))
            .cloned()
    }

    /// Overall progress for a task in `[0, 1]`.
    pub async fn overall_progress(&self, task_id: &str) -> Option<f64> {
        self.inner
            .read()
            .await
            .tasks
            .get(task_id)
            .map(|t| t.overall_progress())
    }

    /// Ids of every subtask currently in the given state.
    pub async fn list_by_state(&self, state: SubtaskState) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .tasks
            .values()
            .flat_map(|t| {
                t.subtasks
                    .iter()
                    .filter(|(_, s)| s.state == state)
                    .map(|(id, _)| id.clone())
            })
            .collect();
        ids.sort();
        ids
    }

    /// Number of tracked tasks.
    pub async fn task_count(&self) -> usize {
        self.inner.read().await.tasks.len()
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_of(ids: &[&str]) -> Plan {
        Plan {
            stages: vec![ids.iter().map(|s| s.to_string()).collect()],
            critical_path: Vec::new(),
            critical_path_len: 1.0,
            can_parallelize: ids.len() > 1,
        }
    }

    #[tokio::test]
    async fn test_legal_walk_and_progress() {
        let tracker = TaskTracker::new();
        tracker.create("t1", &plan_of(&["s1", "s2"])).await;
        assert_eq!(tracker.overall_progress("t1").await, Some(0.0));

        tracker.transition("s1", SubtaskState::Assigned, None).await.unwrap();
        tracker.transition("s1", SubtaskState::InProgress, None).await.unwrap();
        tracker.transition("s1", SubtaskState::Completed, None).await.unwrap();
        assert_eq!(tracker.overall_progress("t1").await, Some(0.5));

        tracker.transition("s2", SubtaskState::Failed, Some("upstream failure".into()))
            .await
            .unwrap();
        assert_eq!(tracker.overall_progress("t1").await, Some(1.0));
        let s2 = tracker.get_subtask("s2").await.unwrap();
        assert_eq!(s2.detail.as_deref(), Some("upstream failure"));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_state_error() {
        let tracker = TaskTracker::new();
        tracker.create("t1", &plan_of(&["s1"])).await;
        let err = tracker
            .transition("s1", SubtaskState::Completed, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "state_error");
    }

    #[tokio::test]
    async fn test_terminal_states_reject_everything() {
        let tracker = TaskTracker::new();
        tracker.create("t1", &plan_of(&["s1"])).await;
        tracker.transition("s1", SubtaskState::Assigned, None).await.unwrap();
        tracker.transition("s1", SubtaskState::InProgress, None).await.unwrap();
        tracker.transition("s1", SubtaskState::Completed, None).await.unwrap();
        assert!(tracker
            .transition("s1", SubtaskState::InProgress, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_by_state() {
        let tracker = TaskTracker::new();
        tracker.create("t1", &plan_of(&["s1", "s2"])).await;
        tracker.transition("s1", SubtaskState::Assigned, None).await.unwrap();
        assert_eq!(tracker.list_by_state(SubtaskState::Pending).await, vec!["s2"]);
        assert_eq!(tracker.list_by_state(SubtaskState::Assigned).await, vec!["s1"]);
    }
}
