//! Execution planning: stages and the critical path.
//!
//! The planner turns a dependency graph into a schedule. Stages are the
//! topological layers — everything inside a stage may run concurrently,
//! successive stages are strictly sequential. The critical path is the
//! longest-weight chain of dependent subtasks; by default every subtask
//! weighs 1.0, but callers can supply historical mean durations per subtask
//! so the path reflects observed cost. The planner allocates nothing — it
//! only emits the schedule.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::taskweave::graph::DependencyGraph;

/// The schedule for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Stages in execution order; each stage lists subtask ids that may run
    /// concurrently.
    pub stages: Vec<Vec<String>>,
    /// Subtask ids on the critical path, in execution order.
    pub critical_path: Vec<String>,
    /// Total weight of the critical path.
    pub critical_path_len: f64,
    /// Whether any stage holds more than one subtask.
    pub can_parallelize: bool,
}

impl Plan {
    /// An empty plan (used by degenerate workflow records).
    pub fn empty() -> Self {
        Self {
            stages: Vec::new(),
            critical_path: Vec::new(),
            critical_path_len: 0.0,
            can_parallelize: false,
        }
    }

    /// Total number of scheduled subtasks.
    pub fn subtask_count(&self) -> usize {
        self.stages.iter().map(|s| s.len()).sum()
    }
}

/// Build the schedule for a graph.
///
/// `weight_of` maps a subtask id to its weight; return 1.0 when no history
/// exists (see the delegation optimizer's duration statistics).
pub fn build_plan<F>(graph: &DependencyGraph, weight_of: F) -> Plan
where
    F: Fn(&str) -> f64,
{
    let stages = graph.layers.clone();

    // Longest path over the DAG, walked in layer order so every
    // prerequisite is finalised before its dependents.
    let mut best: HashMap<&String, (f64, Option<&String>)> = HashMap::new();
    for layer in &graph.layers {
        for id in layer {
            let own = weight_of(id.as_str()).max(0.0);
            let mut weight = own;
            let mut via: Option<&String> = None;
            if let Some(prereqs) = graph.prerequisites.get(id) {
                for prereq in prereqs {
                    if let Some((prereq_weight, _)) = best.get(prereq) {
                        if prereq_weight + own > weight {
                            weight = prereq_weight + own;
                            via = Some(prereq);
                        }
                    }
                }
            }
            best.insert(id, (weight, via));
        }
    }

    let mut critical_path = Vec::new();
    let mut critical_path_len = 0.0;
    if let Some((end, (weight, _))) = best
        .iter()
        .max_by(|a, b| (a.1).0.partial_cmp(&(b.1).0).unwrap_or(std::cmp::Ordering::Equal))
    {
        critical_path_len = *weight;
        let mut cursor: Option<&String> = Some(*end);
        while let Some(id) = cursor {
            critical_path.push(id.clone());
            cursor = best.get(id).and_then(|(_, via)| *via);
        }
        critical_path.reverse();
    }

    let can_parallelize = stages.iter().any(|stage| stage.len() > 1);

    Plan {
        stages,
        critical_path,
        critical_path_len,
        can_parallelize,
    }
}
