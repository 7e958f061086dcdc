//! The orchestrator: the engine's central state machine.
//!
//! [`Orchestrator::execute`] drives the whole pipeline — analyze, decompose,
//! map, plan, then walk the plan stage by stage, dispatching every subtask of
//! a stage concurrently through a bounded worker pool. Each finished subtask
//! is scored by the outcome evaluator and fed to the delegation optimizer;
//! the result aggregator composes the final artifact; long-term memory keeps
//! the workflow record.
//!
//! ```text
//! execute(text, context)
//!   │ analyze ─ decompose ─ map ─ plan
//!   │
//!   ├─ stage 0 ──► [agent] [agent] [agent]     (concurrent, semaphore-bound)
//!   ├─ stage 1 ──► [agent]                     (strictly after stage 0)
//!   │    …
//!   ├─ aggregate ─ evaluate ─ optimize
//!   └─ WorkflowRecord → long-term memory
//! ```
//!
//! The orchestrator never throws for domain failures: a workflow with failed
//! subtasks comes back as a `partial` record, dependents of a failed subtask
//! are skipped with reason `upstream failure`, and cancellation or timeout
//! yields a `cancelled` record with completed work preserved. Only
//! decomposition problems (cyclic graphs, empty decompositions) surface as
//! errors, before anything is dispatched.
//!
//! All collaborators arrive through an explicit [`Environment`] value, so
//! tests construct a fresh environment with fake collaborators instead of
//! touching global state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, Semaphore};

use crate::taskweave::agent::Agent;
use crate::taskweave::aggregator::{self, AggregateFormat};
use crate::taskweave::analyzer;
use crate::taskweave::bus::{BusMessage, EventKind, MessageBus};
use crate::taskweave::config::EngineConfig;
use crate::taskweave::decomposer;
use crate::taskweave::error::{EngineError, EngineResult};
use crate::taskweave::feedback::{self, DelegationOptimizer};
use crate::taskweave::graph;
use crate::taskweave::inference::{
    ChatMessage, GenerationOptions, InferenceClient, TaskClass,
};
use crate::taskweave::memory::{LongTermMemory, SessionMemory};
use crate::taskweave::persona::{PersonaDna, PersonaRecord, PersonaStore, MATCH_THRESHOLD};
use crate::taskweave::plan::{self, Plan};
use crate::taskweave::task::{
    Subtask, SubtaskResult, SubtaskState, Task, Turn, WorkflowRecord, WorkflowStatus,
    WorkflowTimings,
};
use crate::taskweave::tracker::TaskTracker;

/// How long the persona-generation call may take before the stock DNA wins.
const PERSONA_GENERATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Grace period given to in-flight agents when a workflow is cancelled.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Everything the orchestrator needs, passed explicitly instead of living in
/// globals. Tests build one of these around fake collaborators.
pub struct Environment {
    pub config: EngineConfig,
    pub inference: Arc<dyn InferenceClient>,
    pub personas: Arc<PersonaStore>,
    pub bus: Arc<MessageBus>,
    pub tracker: Arc<TaskTracker>,
    pub sessions: Arc<SessionMemory>,
    pub long_term: Arc<LongTermMemory>,
    pub optimizer: Arc<DelegationOptimizer>,
    /// Resolved prompt prefix from the external personality configuration.
    pub personality_prefix: String,
}

impl Environment {
    /// Open the on-disk stores under `config.data_dir` and wire everything
    /// together.
    pub fn new(config: EngineConfig, inference: Arc<dyn InferenceClient>) -> EngineResult<Self> {
        let personas = Arc::new(PersonaStore::open(&config.data_dir)?);
        let long_term = Arc::new(LongTermMemory::open(&config.data_dir)?);
        let sessions = Arc::new(SessionMemory::with_dir(config.memory_window, &config.data_dir));
        let optimizer = Arc::new(DelegationOptimizer::new(Arc::clone(&personas)));
        Ok(Self {
            config,
            inference,
            personas,
            bus: Arc::new(MessageBus::new()),
            tracker: Arc::new(TaskTracker::new()),
            sessions,
            long_term,
            optimizer,
            personality_prefix: String::new(),
        })
    }

    /// Reload the persona library from disk (picking up records written by
    /// another process) and announce it on the bus.
    pub async fn reload_personas(&self) -> EngineResult<usize> {
        let count = self.personas.reload().await?;
        self.bus.publish(
            BusMessage::new(EventKind::KnowledgeReloaded).with_detail(count.to_string()),
        );
        log::info!("persona library reloaded, {} personas", count);
        Ok(count)
    }
}

/// Drives tasks through the decomposition-dispatch-aggregation pipeline.
pub struct Orchestrator {
    env: Arc<Environment>,
}

/// Shared result collection the spawned agents write into, so partial work
/// survives cancellation.
type ResultsById = Arc<Mutex<HashMap<String, SubtaskResult>>>;
type OutputsById = Arc<Mutex<HashMap<String, String>>>;

impl Orchestrator {
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Run a workflow end to end.
    ///
    /// Returns a [`WorkflowRecord`] for every outcome except decomposition
    /// failure: domain failures become a `partial` record, cancellation and
    /// timeout a `cancelled` one. A task id that already has a terminal
    /// record returns that record unchanged (idempotence).
    pub async fn execute(
        &self,
        task_text: &str,
        context: BTreeMap<String, String>,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> EngineResult<WorkflowRecord> {
        let task_id = context
            .get("task_id")
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(existing) = self.env.long_term.find_by_task_id(&task_id).await {
            log::info!("task {} already has a terminal record, returning it", task_id);
            return Ok(existing);
        }

        let total_start = Instant::now();
        self.env
            .bus
            .publish(BusMessage::new(EventKind::TaskStarted).with_task(&task_id));

        // Analyze.
        let analysis_start = Instant::now();
        let analysis = analyzer::analyze(task_text, &context);
        let analysis_ms = analysis_start.elapsed().as_millis() as u64;
        log::info!(
            "task {}: complexity={} domains=[{}] score={}",
            task_id,
            analysis.complexity,
            analysis
                .domains
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            analysis.score
        );
        let task = Task::new(
            task_id.clone(),
            task_text.to_string(),
            context.clone(),
            analysis.complexity,
            analysis.domains.clone(),
        );

        // Decompose, map, plan.
        let planning_start = Instant::now();
        let mut decomposition =
            decomposer::decompose(&task, &analysis, self.env.inference.as_ref(), &self.env.optimizer)
                .await?;
        let dag = graph::build(&mut decomposition)?;

        let mut weights: HashMap<String, f64> = HashMap::new();
        for subtask in &decomposition.subtasks {
            let weight = match self.env.optimizer.mean_duration_ms(subtask.domain).await {
                Some(ms) => (ms / 1000.0).max(0.001),
                None => 1.0,
            };
            weights.insert(subtask.id.clone(), weight);
        }
        let plan = plan::build_plan(&dag, |id| weights.get(id).copied().unwrap_or(1.0));
        let planning_ms = planning_start.elapsed().as_millis() as u64;

        self.env.tracker.create(&task_id, &plan).await;
        log::info!(
            "task {}: {} subtasks over {} stages (critical path {:.1})",
            task_id,
            plan.subtask_count(),
            plan.stages.len(),
            plan.critical_path_len
        );

        // Dispatch, racing cancellation and the workflow deadline.
        let dispatch_start = Instant::now();
        let results: ResultsById = Arc::new(Mutex::new(HashMap::new()));
        let outputs: OutputsById = Arc::new(Mutex::new(HashMap::new()));
        let subtasks: HashMap<String, Subtask> = decomposition
            .subtasks
            .iter()
            .cloned()
            .map(|s| (s.id.clone(), s))
            .collect();

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.env.config.workflow_timeout_secs.max(1));
        let status = self
            .run_stages(&task, &plan, &subtasks, &results, &outputs, &mut cancel, deadline)
            .await;
        if let Some(reason) = &status {
            log::warn!("task {}: {}", task_id, reason);
        }
        let dispatch_ms = dispatch_start.elapsed().as_millis() as u64;

        // Assemble results in plan order, synthesising entries for anything
        // that never reached a terminal state.
        let results_by_id = results.lock().await;
        let cancelled = status.is_some();
        let mut ordered: Vec<SubtaskResult> = Vec::with_capacity(plan.subtask_count());
        for stage in &plan.stages {
            for id in stage {
                if let Some(result) = results_by_id.get(id) {
                    ordered.push(result.clone());
                } else if let Some(subtask) = subtasks.get(id) {
                    let tracked = self.env.tracker.get_subtask(id).await;
                    let state = tracked.as_ref().map(|t| t.state).unwrap_or(SubtaskState::Pending);
                    let (state, reason) = if cancelled && !state.is_terminal() {
                        (SubtaskState::Failed, Some("Cancelled".to_string()))
                    } else {
                        (state, None)
                    };
                    ordered.push(SubtaskResult {
                        subtask_id: id.clone(),
                        description: subtask.description.clone(),
                        domain: subtask.domain,
                        state,
                        output: None,
                        failure_reason: reason,
                        score: None,
                        duration_ms: None,
                    });
                }
            }
        }
        drop(results_by_id);

        let workflow_status = if cancelled {
            WorkflowStatus::Cancelled
        } else if ordered.iter().any(|r| r.state == SubtaskState::Failed) {
            WorkflowStatus::Partial
        } else {
            WorkflowStatus::Ok
        };

        // Aggregate.
        let aggregation_start = Instant::now();
        let format = context
            .get("format")
            .map(|f| AggregateFormat::parse(f))
            .unwrap_or_default();
        let aggregated = aggregator::aggregate(&plan, &ordered, format);
        let aggregation_ms = aggregation_start.elapsed().as_millis() as u64;

        let record = WorkflowRecord {
            task_id: task_id.clone(),
            task_text: task_text.to_string(),
            status: workflow_status,
            plan,
            results: ordered,
            aggregated,
            timings: WorkflowTimings {
                total_ms: total_start.elapsed().as_millis() as u64,
                analysis_ms,
                planning_ms,
                dispatch_ms,
                aggregation_ms,
            },
            completed_at: chrono::Utc::now(),
        };

        if let Err(e) = self.env.long_term.store(record.clone()).await {
            log::error!("task {}: record not persisted: {}", task_id, e);
        }
        self.env
            .bus
            .publish(BusMessage::new(EventKind::TaskFinished).with_task(&task_id));
        Ok(record)
    }

    /// The `use_orchestrator = false` path: a single direct inference call
    /// wrapped into a one-subtask workflow record. No decomposition, no
    /// personas.
    pub async fn execute_direct(
        &self,
        task_text: &str,
        context: BTreeMap<String, String>,
    ) -> WorkflowRecord {
        let task_id = context
            .get("task_id")
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let started = Instant::now();
        let outcome = self
            .env
            .inference
            .chat(
                TaskClass::Conversation,
                &[ChatMessage::user(task_text)],
                &GenerationOptions::default(),
            )
            .await;

        let mut subtask = Subtask::new(&task_id, task_text, crate::taskweave::task::Domain::Other);
        let (status, state, output, reason) = match outcome {
            Ok(text) => (WorkflowStatus::Ok, SubtaskState::Completed, Some(text), None),
            Err(e) => (
                WorkflowStatus::Partial,
                SubtaskState::Failed,
                None,
                Some(e.kind_name().to_string()),
            ),
        };
        subtask.state = state;
        subtask.output = output.clone();
        subtask.failure_reason = reason.clone();

        let plan = Plan {
            stages: vec![vec![subtask.id.clone()]],
            critical_path: vec![subtask.id.clone()],
            critical_path_len: 1.0,
            can_parallelize: false,
        };
        let result = SubtaskResult {
            subtask_id: subtask.id.clone(),
            description: subtask.description.clone(),
            domain: subtask.domain,
            state,
            output: output.clone(),
            failure_reason: reason,
            score: None,
            duration_ms: Some(started.elapsed().as_millis() as u64),
        };
        let aggregated = output.unwrap_or_else(|| {
            result
                .failure_reason
                .as_deref()
                .map(|r| format!("(failed: {})", r))
                .unwrap_or_default()
        });
        let record = WorkflowRecord {
            task_id,
            task_text: task_text.to_string(),
            status,
            plan,
            results: vec![result],
            aggregated,
            timings: WorkflowTimings {
                total_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            },
            completed_at: chrono::Utc::now(),
        };
        if let Err(e) = self.env.long_term.store(record.clone()).await {
            log::error!("direct task record not persisted: {}", e);
        }
        record
    }

    /// Walk the plan's stages in order, dispatching each stage's runnable
    /// subtasks concurrently. Dependents of failed subtasks are skipped with
    /// reason `upstream failure`; siblings proceed normally.
    ///
    /// Returns `None` on natural completion, or the cancellation/timeout
    /// error that stopped the walk. On a stop, in-flight agents get a short
    /// grace window ([`CANCEL_GRACE`]) and are then abandoned; no further
    /// stage is dispatched.
    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        task: &Task,
        plan: &Plan,
        subtasks: &HashMap<String, Subtask>,
        results: &ResultsById,
        outputs: &OutputsById,
        cancel: &mut Option<watch::Receiver<bool>>,
        deadline: tokio::time::Instant,
    ) -> Option<EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.env.config.max_concurrent));
        let mut failed: HashSet<String> = HashSet::new();

        let memory: Vec<Turn> = match task.context.get("session_id") {
            Some(session_id) => self.env.sessions.history(session_id).await,
            None => Vec::new(),
        };

        for (stage_idx, stage) in plan.stages.iter().enumerate() {
            let stage_run = self.dispatch_stage(
                task,
                stage,
                stage_idx,
                subtasks,
                results,
                outputs,
                &semaphore,
                &memory,
                &mut failed,
            );
            tokio::pin!(stage_run);
            let stopped = tokio::select! {
                _ = &mut stage_run => None,
                _ = wait_cancelled(cancel) => Some(EngineError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Some(EngineError::WorkflowTimeout),
            };
            if let Some(err) = stopped {
                // One chance for in-flight agents to finish, then abandon.
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut stage_run).await;
                return Some(err);
            }
        }
        None
    }

    /// Dispatch one stage: skip subtasks with failed prerequisites, resolve
    /// personas, spawn the rest concurrently, and fold join results into the
    /// failure set.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_stage(
        &self,
        task: &Task,
        stage: &[String],
        stage_idx: usize,
        subtasks: &HashMap<String, Subtask>,
        results: &ResultsById,
        outputs: &OutputsById,
        semaphore: &Arc<Semaphore>,
        memory: &[Turn],
        failed: &mut HashSet<String>,
    ) {
        let mut handles = Vec::new();
        for id in stage {
            let Some(subtask) = subtasks.get(id) else {
                continue;
            };

            // Upstream failure: skip without dispatch.
            if subtask.prerequisites.iter().any(|p| failed.contains(p)) {
                failed.insert(id.clone());
                let _ = self
                    .env
                    .tracker
                    .transition(id, SubtaskState::Failed, Some("upstream failure".into()))
                    .await;
                self.env.bus.publish(
                    BusMessage::new(EventKind::SubtaskFailed)
                        .with_task(&task.id)
                        .with_subtask(id)
                        .with_detail("upstream failure"),
                );
                results.lock().await.insert(
                    id.clone(),
                    SubtaskResult {
                        subtask_id: id.clone(),
                        description: subtask.description.clone(),
                        domain: subtask.domain,
                        state: SubtaskState::Failed,
                        output: None,
                        failure_reason: Some("upstream failure".to_string()),
                        score: None,
                        duration_ms: None,
                    },
                );
                continue;
            }

            let persona = self.resolve_persona(subtask).await;
            let agent = Agent::new(persona.clone(), Arc::clone(&self.env.inference));

            let mut subtask = subtask.clone();
            subtask.agent_id = Some(agent.id.clone());
            subtask.state = SubtaskState::Assigned;
            if self
                .env
                .tracker
                .transition(id, SubtaskState::Assigned, None)
                .await
                .is_err()
            {
                continue;
            }
            self.env.bus.publish(
                BusMessage::new(EventKind::SubtaskAssigned)
                    .with_task(&task.id)
                    .with_subtask(id)
                    .with_detail(persona.dna.role.clone()),
            );

            let prereq_outputs: Vec<(String, String)> = {
                let outputs = outputs.lock().await;
                subtask
                    .prerequisites
                    .iter()
                    .filter_map(|p| {
                        let output = outputs.get(p)?;
                        let description = subtasks
                            .get(p)
                            .map(|s| s.description.clone())
                            .unwrap_or_else(|| p.clone());
                        Some((description, output.clone()))
                    })
                    .collect()
            };

            handles.push(self.spawn_subtask(
                task.id.clone(),
                subtask,
                agent,
                persona,
                prereq_outputs,
                memory.to_vec(),
                Arc::clone(semaphore),
                Arc::clone(results),
                Arc::clone(outputs),
            ));
        }

        for join in futures_util::future::join_all(handles).await {
            match join {
                Ok((id, success)) => {
                    if !success {
                        failed.insert(id);
                    }
                }
                Err(e) => log::error!("subtask join error in stage {}: {}", stage_idx, e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_subtask(
        &self,
        task_id: String,
        mut subtask: Subtask,
        agent: Agent,
        persona: PersonaRecord,
        prereq_outputs: Vec<(String, String)>,
        memory: Vec<Turn>,
        semaphore: Arc<Semaphore>,
        results: ResultsById,
        outputs: OutputsById,
    ) -> tokio::task::JoinHandle<(String, bool)> {
        let tracker = Arc::clone(&self.env.tracker);
        let bus = Arc::clone(&self.env.bus);
        let optimizer = Arc::clone(&self.env.optimizer);
        let personality = self.env.personality_prefix.clone();

        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("worker-pool semaphore never closes");

            let id = subtask.id.clone();
            if tracker
                .transition(&id, SubtaskState::InProgress, None)
                .await
                .is_err()
            {
                return (id, false);
            }
            bus.publish(
                BusMessage::new(EventKind::SubtaskStarted)
                    .with_task(&task_id)
                    .with_subtask(&id),
            );

            let started = Instant::now();
            let outcome = agent.run(&subtask, &personality, &memory, &prereq_outputs).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let success = match outcome {
                Ok(output) => {
                    let _ = tracker.transition(&id, SubtaskState::Completed, None).await;
                    bus.publish(
                        BusMessage::new(EventKind::SubtaskCompleted)
                            .with_task(&task_id)
                            .with_subtask(&id),
                    );
                    subtask.state = SubtaskState::Completed;
                    subtask.output = Some(output.clone());
                    outputs.lock().await.insert(id.clone(), output);
                    true
                }
                Err(e) => {
                    let reason = e.kind_name().to_string();
                    log::warn!("subtask {} failed: {}", id, e);
                    let _ = tracker
                        .transition(&id, SubtaskState::Failed, Some(e.to_string()))
                        .await;
                    bus.publish(
                        BusMessage::new(EventKind::SubtaskFailed)
                            .with_task(&task_id)
                            .with_subtask(&id)
                            .with_detail(e.to_string()),
                    );
                    subtask.state = SubtaskState::Failed;
                    subtask.failure_reason = Some(reason);
                    false
                }
            };

            let score = feedback::evaluate(&subtask, &persona.dna.output_format);
            if let Err(e) = optimizer
                .record_outcome(&persona.id, subtask.domain, &score, Some(duration_ms))
                .await
            {
                log::debug!("outcome for persona {} not recorded: {}", persona.id, e);
            }

            results.lock().await.insert(
                id.clone(),
                SubtaskResult {
                    subtask_id: id.clone(),
                    description: subtask.description.clone(),
                    domain: subtask.domain,
                    state: subtask.state,
                    output: subtask.output.clone(),
                    failure_reason: subtask.failure_reason.clone(),
                    score: Some(score.overall),
                    duration_ms: Some(duration_ms),
                },
            );
            (id, success)
        })
    }

    /// Obtain a persona for a subtask: optimizer suggestion, then a library
    /// match at or above the reuse threshold, then generation (with a stock
    /// fallback). A persona-store failure falls back to an in-memory persona
    /// for this workflow only.
    async fn resolve_persona(&self, subtask: &Subtask) -> PersonaRecord {
        if let Some(suggested) = &subtask.suggested_persona_id {
            if let Some(record) = self.env.personas.get(suggested).await {
                return record;
            }
        }

        let requirements = PersonaDna::default_for(subtask.domain, "");
        if let Some((record, similarity)) = self.env.personas.match_best(&requirements).await {
            if similarity >= MATCH_THRESHOLD {
                log::debug!(
                    "reusing persona {} for {} (similarity {:.2})",
                    record.dna.role,
                    subtask.domain,
                    similarity
                );
                return record;
            }
        }

        let dna = self.generate_dna(subtask).await.unwrap_or(requirements);
        match self.env.personas.insert(dna.clone()).await {
            Ok(id) => {
                self.env.bus.publish(
                    BusMessage::new(EventKind::PersonaCreated)
                        .with_task(&subtask.task_id)
                        .with_detail(dna.role.clone()),
                );
                self.env
                    .personas
                    .get(&id)
                    .await
                    .unwrap_or_else(|| in_memory_record(dna))
            }
            Err(e) => {
                log::warn!("persona not persisted, using in-memory fallback: {}", e);
                in_memory_record(dna)
            }
        }
    }

    /// Ask the model to fill in a DNA template for this subtask's domain.
    async fn generate_dna(&self, subtask: &Subtask) -> Option<PersonaDna> {
        let prompt = format!(
            "Define a specialist persona for this work item.\n\
             Work item: {}\nDomain: {}\n\n\
             Answer with a single JSON object and nothing else, shaped as:\n\
             {{\"role\": \"<role with seniority>\", \"domain\": \"<domain>\", \
             \"methodologies\": [\"...\"], \"constraints\": {{}}, \"output_format\": {{\"style\": \"markdown\"}}}}",
            subtask.description, subtask.domain
        );
        let messages = [ChatMessage::user(prompt)];
        let options = GenerationOptions::default();
        let call = self.env.inference.chat(
            TaskClass::General,
            &messages,
            &options,
        );
        let response = match tokio::time::timeout(PERSONA_GENERATION_TIMEOUT, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                log::debug!("persona generation failed: {}", e);
                return None;
            }
            Err(_) => {
                log::debug!("persona generation timed out");
                return None;
            }
        };
        let start = response.find('{')?;
        let end = response.rfind('}')?;
        serde_json::from_str::<PersonaDna>(&response[start..=end]).ok()
    }
}

/// Build a non-persisted persona record (persona-store fallback path).
fn in_memory_record(dna: PersonaDna) -> PersonaRecord {
    PersonaRecord {
        id: dna.fingerprint(),
        dna,
        created_at: chrono::Utc::now(),
        usage_count: 0,
        score: 0.5,
        last_used: None,
    }
}

/// Resolve once the cancellation signal fires; pends forever without one.
async fn wait_cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            if *rx.borrow() {
                return;
            }
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
            // Sender dropped without cancelling: never resolve.
            futures_util::future::pending::<()>().await;
        }
        None => futures_util::future::pending::<()>().await,
    }
}
