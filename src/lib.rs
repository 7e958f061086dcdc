// src/lib.rs

// Import the top-level `taskweave` module.
pub mod taskweave;

// Re-export the module tree at the crate root so external code (and doc
// examples) can use `taskweave::inference::...` instead of
// `taskweave::taskweave::inference::...`.
pub use taskweave::{
    agent, aggregator, analyzer, bus, config, decomposer, error, feedback, graph, inference,
    memory, orchestrator, persona, plan, server, task, tracker,
};

// Re-exporting key items for easier external access.
pub use taskweave::agent::Agent;
pub use taskweave::config::EngineConfig;
pub use taskweave::error::{EngineError, EngineResult};
pub use taskweave::inference::{InferenceClient, LocalInferenceClient};
pub use taskweave::orchestrator::{Environment, Orchestrator};
pub use taskweave::persona::{PersonaDna, PersonaStore};
