//! Analyzer → decomposer → mapper → planner, exercised without an
//! orchestrator around them.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use taskweave::analyzer;
use taskweave::decomposer;
use taskweave::error::EngineResult;
use taskweave::feedback::DelegationOptimizer;
use taskweave::graph;
use taskweave::inference::{ChatMessage, ChunkStream, GenerationOptions, InferenceClient, TaskClass};
use taskweave::persona::PersonaStore;
use taskweave::plan;
use taskweave::task::{Complexity, Domain, Task};

/// Refinement responder: echoes back whatever numbered lines it was sent,
/// rewritten, so the line count always matches.
struct RefiningClient;

#[async_trait]
impl InferenceClient for RefiningClient {
    async fn chat(
        &self,
        _class: TaskClass,
        messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> EngineResult<String> {
        let prompt = &messages.last().unwrap().content;
        let rewritten: Vec<String> = prompt
            .lines()
            .filter(|l| {
                let t = l.trim();
                t.starts_with(|c: char| c.is_ascii_digit())
            })
            .enumerate()
            .map(|(i, _)| format!("{}. refined step {}", i + 1, i + 1))
            .collect();
        Ok(rewritten.join("\n"))
    }

    async fn chat_stream(
        &self,
        _class: TaskClass,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> EngineResult<ChunkStream> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn health(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// A client whose refinement answer adds a step — the decomposer must
/// discard it.
struct OverEagerClient;

#[async_trait]
impl InferenceClient for OverEagerClient {
    async fn chat(
        &self,
        _class: TaskClass,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> EngineResult<String> {
        Ok("1. a\n2. b\n3. c\n4. d\n5. e\n6. f\n7. g\n8. h\n9. i\n10. j".to_string())
    }

    async fn chat_stream(
        &self,
        _class: TaskClass,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> EngineResult<ChunkStream> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn health(&self) -> EngineResult<()> {
        Ok(())
    }
}

fn task_of(text: &str) -> (Task, taskweave::analyzer::Analysis) {
    let analysis = analyzer::analyze(text, &BTreeMap::new());
    let task = Task::new(
        "t-test".to_string(),
        text.to_string(),
        BTreeMap::new(),
        analysis.complexity,
        analysis.domains.clone(),
    );
    (task, analysis)
}

async fn optimizer(dir: &tempfile::TempDir) -> DelegationOptimizer {
    DelegationOptimizer::new(Arc::new(PersonaStore::open(dir.path()).unwrap()))
}

#[tokio::test]
async fn test_simple_task_is_one_subtask() {
    let dir = tempfile::tempdir().unwrap();
    let (task, analysis) = task_of("say hi");
    assert_eq!(analysis.complexity, Complexity::Simple);

    let d = decomposer::decompose(&task, &analysis, &RefiningClient, &optimizer(&dir).await)
        .await
        .unwrap();
    assert_eq!(d.subtasks.len(), 1);
    assert_eq!(d.subtasks[0].description, "say hi");
}

#[tokio::test]
async fn test_multi_domain_templates_interleave_and_chain() {
    let dir = tempfile::tempdir().unwrap();
    let (task, analysis) = task_of("Build a REST API with authentication and deploy it to AWS");
    assert_eq!(analysis.complexity, Complexity::Complex);
    assert_eq!(analysis.domains, vec![Domain::Development, Domain::Devops]);

    let mut d = decomposer::decompose(&task, &analysis, &RefiningClient, &optimizer(&dir).await)
        .await
        .unwrap();
    // development (3 steps) + devops (4 steps)
    assert_eq!(d.subtasks.len(), 7);
    assert_eq!(d.chains.len(), 2);
    // Emission order interleaves round-robin in analyzer domain order.
    assert_eq!(d.subtasks[0].domain, Domain::Development);
    assert_eq!(d.subtasks[1].domain, Domain::Devops);
    assert_eq!(d.subtasks[2].domain, Domain::Development);

    let dag = graph::build(&mut d).unwrap();
    let built = plan::build_plan(&dag, |_| 1.0);
    assert_eq!(built.stages.len(), 4);
    assert!(built.can_parallelize);
    assert_eq!(built.stages[0].len(), 2);
    // The devops chain is the longer one.
    assert!((built.critical_path_len - 4.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_refinement_rewrites_without_resizing() {
    let dir = tempfile::tempdir().unwrap();
    let (task, analysis) = task_of("Build a REST API with authentication and deploy it to AWS");

    let refined =
        decomposer::decompose(&task, &analysis, &RefiningClient, &optimizer(&dir).await)
            .await
            .unwrap();
    assert!(refined.subtasks.iter().all(|s| s.description.starts_with("refined step")));

    let kept = decomposer::decompose(&task, &analysis, &OverEagerClient, &optimizer(&dir).await)
        .await
        .unwrap();
    // Ten lines for seven steps: discarded, templates kept verbatim.
    assert_eq!(kept.subtasks.len(), 7);
    assert!(kept.subtasks.iter().all(|s| s.description.contains("Build a REST API")));
}

#[tokio::test]
async fn test_sequence_chain_plans_five_stages() {
    let dir = tempfile::tempdir().unwrap();
    let (task, analysis) = task_of("A and then B and then C and then D and then E");

    let mut d = decomposer::decompose(&task, &analysis, &RefiningClient, &optimizer(&dir).await)
        .await
        .unwrap();
    assert_eq!(d.subtasks.len(), 5);

    let dag = graph::build(&mut d).unwrap();
    let built = plan::build_plan(&dag, |_| 1.0);
    assert_eq!(built.stages.len(), 5);
    assert!(built.stages.iter().all(|s| s.len() == 1));
    assert!(!built.can_parallelize);
    assert!((built.critical_path_len - 5.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_stage_ordering_invariant() {
    let dir = tempfile::tempdir().unwrap();
    let (task, analysis) = task_of("Build a REST API with authentication and deploy it to AWS");
    let mut d = decomposer::decompose(&task, &analysis, &RefiningClient, &optimizer(&dir).await)
        .await
        .unwrap();
    let dag = graph::build(&mut d).unwrap();
    let built = plan::build_plan(&dag, |_| 1.0);

    let stage_of = |id: &String| {
        built
            .stages
            .iter()
            .position(|stage| stage.contains(id))
            .unwrap()
    };
    for subtask in &d.subtasks {
        for prereq in &subtask.prerequisites {
            assert!(
                stage_of(prereq) < stage_of(&subtask.id),
                "prerequisite scheduled at or after its dependent"
            );
        }
    }
}
