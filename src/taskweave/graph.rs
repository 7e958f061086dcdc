//! Dependency mapping: prerequisite edges, cycle detection, topological
//! layers.
//!
//! Edges come from two sources: adjacency inside the chains the decomposer
//! emitted (template order / explicit sequence order), and `requires <...>`
//! cross-references written into subtask descriptions. The mapper refuses a
//! cyclic graph with [`EngineError::Decomposition`] before anything is
//! dispatched.

use std::collections::{HashMap, HashSet};

use crate::taskweave::decomposer::Decomposition;
use crate::taskweave::error::{EngineError, EngineResult};

/// The dependency DAG over one decomposition.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Subtask id → ids of its prerequisites.
    pub prerequisites: HashMap<String, Vec<String>>,
    /// Topological layers in increasing depth; every subtask in layer `k`
    /// has all of its prerequisites in layers `< k`.
    pub layers: Vec<Vec<String>>,
}

/// Build the DAG for a decomposition, writing prerequisite ids back onto the
/// subtasks.
pub fn build(decomposition: &mut Decomposition) -> EngineResult<DependencyGraph> {
    let ids: Vec<String> = decomposition.subtasks.iter().map(|s| s.id.clone()).collect();
    let id_set: HashSet<&String> = ids.iter().collect();
    let mut prerequisites: HashMap<String, Vec<String>> =
        ids.iter().map(|id| (id.clone(), Vec::new())).collect();

    // Chain adjacency: each chain is a strict sequence.
    for chain in &decomposition.chains {
        for pair in chain.windows(2) {
            if id_set.contains(&pair[0]) && id_set.contains(&pair[1]) {
                prerequisites
                    .get_mut(&pair[1])
                    .expect("chain ids come from the subtask list")
                    .push(pair[0].clone());
            }
        }
    }

    // Explicit cross-references: "requires <text>" pulls in the subtask
    // whose description matches the referenced text.
    for i in 0..decomposition.subtasks.len() {
        let description = decomposition.subtasks[i].description.to_lowercase();
        let Some(pos) = description.find("requires ") else {
            continue;
        };
        let reference = description[pos + "requires ".len()..]
            .split(|c| c == '.' || c == ';' || c == '\n')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if reference.is_empty() {
            continue;
        }
        let target = decomposition
            .subtasks
            .iter()
            .enumerate()
            .find(|(j, other)| *j != i && other.description.to_lowercase().contains(&reference));
        if let Some((_, other)) = target {
            let other_id = other.id.clone();
            let this_id = decomposition.subtasks[i].id.clone();
            let prereqs = prerequisites.get_mut(&this_id).expect("own id is indexed");
            if !prereqs.contains(&other_id) {
                prereqs.push(other_id);
            }
        }
    }

    // Kahn's algorithm: layers out, cycles refused.
    let mut dependents: HashMap<&String, Vec<&String>> = HashMap::new();
    let mut in_degree: HashMap<&String, usize> = ids.iter().map(|id| (id, 0)).collect();
    for (id, prereqs) in &prerequisites {
        for prereq in prereqs {
            dependents.entry(prereq).or_default().push(id);
        }
        *in_degree.get_mut(id).expect("all ids are seeded") = prereqs.len();
    }

    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut placed = 0usize;
    // Preserve emission order inside each layer for deterministic plans.
    let mut remaining: Vec<&String> = ids.iter().collect();
    while !remaining.is_empty() {
        let layer: Vec<String> = remaining
            .iter()
            .filter(|id| in_degree[**id] == 0)
            .map(|id| (*id).clone())
            .collect();
        if layer.is_empty() {
            return Err(EngineError::Decomposition(
                "cyclic dependency between subtasks".into(),
            ));
        }
        for id in &layer {
            if let Some(children) = dependents.get(id) {
                for child in children {
                    *in_degree.get_mut(*child).expect("all ids are seeded") -= 1;
                }
            }
        }
        remaining.retain(|id| !layer.contains(*id));
        placed += layer.len();
        layers.push(layer);
    }
    debug_assert_eq!(placed, ids.len());

    // Persist the edges onto the subtasks themselves.
    for subtask in &mut decomposition.subtasks {
        subtask.prerequisites = prerequisites.get(&subtask.id).cloned().unwrap_or_default();
    }

    Ok(DependencyGraph {
        prerequisites,
        layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskweave::task::{Domain, Subtask};

    fn decomposition_of(descriptions: &[&str], chains: &[&[usize]]) -> Decomposition {
        let subtasks: Vec<Subtask> = descriptions
            .iter()
            .map(|d| Subtask::new("t1", *d, Domain::Development))
            .collect();
        let chains = chains
            .iter()
            .map(|chain| chain.iter().map(|i| subtasks[*i].id.clone()).collect())
            .collect();
        Decomposition { subtasks, chains }
    }

    #[test]
    fn test_chain_becomes_layers_of_one() {
        let mut d = decomposition_of(&["a", "b", "c"], &[&[0, 1, 2]]);
        let graph = build(&mut d).unwrap();
        assert_eq!(graph.layers.len(), 3);
        assert!(graph.layers.iter().all(|l| l.len() == 1));
        assert_eq!(d.subtasks[2].prerequisites, vec![d.subtasks[1].id.clone()]);
    }

    #[test]
    fn test_parallel_chains_share_layers() {
        let mut d = decomposition_of(&["a1", "b1", "a2", "b2"], &[&[0, 2], &[1, 3]]);
        let graph = build(&mut d).unwrap();
        assert_eq!(graph.layers.len(), 2);
        assert_eq!(graph.layers[0].len(), 2);
        assert_eq!(graph.layers[1].len(), 2);
    }

    #[test]
    fn test_requires_reference_adds_edge() {
        let mut d = decomposition_of(
            &["write the schema", "load fixtures, requires write the schema"],
            &[&[0], &[1]],
        );
        let graph = build(&mut d).unwrap();
        assert_eq!(graph.layers.len(), 2);
        assert_eq!(d.subtasks[1].prerequisites.len(), 1);
    }

    #[test]
    fn test_cycle_is_refused() {
        let mut d = decomposition_of(&["a", "b"], &[&[0, 1], &[1, 0]]);
        let err = build(&mut d).unwrap_err();
        assert_eq!(err.code(), "decomposition_error");
    }

    #[test]
    fn test_no_prereq_in_later_stage() {
        let mut d = decomposition_of(&["a", "b", "c", "d"], &[&[0, 1, 2], &[3, 2]]);
        let graph = build(&mut d).unwrap();
        let depth_of = |id: &String| {
            graph
                .layers
                .iter()
                .position(|layer| layer.contains(id))
                .unwrap()
        };
        for (id, prereqs) in &graph.prerequisites {
            for prereq in prereqs {
                assert!(depth_of(prereq) < depth_of(id));
            }
        }
    }
}
