//! One-shot agent runtime.
//!
//! An [`Agent`] is the ephemeral binding of a persona snapshot to an
//! inference client for exactly one subtask: created at dispatch, destroyed
//! when the subtask terminates, never retried (the orchestrator models a
//! retry as a new subtask). It holds no state between subtasks and never
//! mutates the persona record — outcomes flow back by id through the
//! delegation optimizer.
//!
//! The prompt an agent sends is the concatenation of:
//!
//! 1. the persona preamble (role, methodologies, constraints),
//! 2. the resolved personality prefix from the external personality config,
//! 3. a serialized list of prerequisite outputs,
//! 4. the subtask description,
//! 5. a trailer requesting output in the persona's declared format.

use std::sync::Arc;

use crate::taskweave::error::EngineResult;
use crate::taskweave::inference::{ChatMessage, GenerationOptions, InferenceClient, TaskClass};
use crate::taskweave::persona::PersonaRecord;
use crate::taskweave::task::{Domain, Subtask, Turn, TurnRole};

/// Ephemeral executor for a single subtask.
pub struct Agent {
    /// Runtime identity of this dispatch, recorded on the subtask.
    pub id: String,
    persona: PersonaRecord,
    client: Arc<dyn InferenceClient>,
}

impl Agent {
    /// Bind a persona snapshot to an inference client.
    pub fn new(persona: PersonaRecord, client: Arc<dyn InferenceClient>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            persona,
            client,
        }
    }

    /// Id of the persona this agent runs as.
    pub fn persona_id(&self) -> &str {
        &self.persona.id
    }

    /// Execute the subtask: build the prompt, call the model once, return
    /// the raw output. Errors propagate untouched — the orchestrator turns
    /// them into a failed subtask with the reason preserved.
    pub async fn run(
        &self,
        subtask: &Subtask,
        personality_prefix: &str,
        memory: &[Turn],
        prerequisite_outputs: &[(String, String)],
    ) -> EngineResult<String> {
        let messages = self.build_messages(subtask, personality_prefix, memory, prerequisite_outputs);
        let class = task_class_for(subtask.domain);
        self.client
            .chat(class, &messages, &GenerationOptions::default())
            .await
    }

    fn build_messages(
        &self,
        subtask: &Subtask,
        personality_prefix: &str,
        memory: &[Turn],
        prerequisite_outputs: &[(String, String)],
    ) -> Vec<ChatMessage> {
        let mut system = String::new();
        system.push_str(&format!("You are a {}.\n", self.persona.dna.role));
        if !self.persona.dna.methodologies.is_empty() {
            system.push_str(&format!(
                "You work by: {}.\n",
                self.persona.dna.methodologies.join(", ")
            ));
        }
        for (name, value) in &self.persona.dna.constraints {
            system.push_str(&format!("Constraint — {}: {}\n", name, value));
        }
        if !personality_prefix.is_empty() {
            system.push('\n');
            system.push_str(personality_prefix);
            system.push('\n');
        }

        let mut messages = vec![ChatMessage::system(system)];

        // Conversational context precedes the work item.
        for turn in memory {
            match turn.role {
                TurnRole::User => messages.push(ChatMessage::user(turn.text.clone())),
                TurnRole::Assistant => messages.push(ChatMessage::assistant(turn.text.clone())),
            }
        }

        let mut body = String::new();
        if !prerequisite_outputs.is_empty() {
            body.push_str("Results from prerequisite steps:\n\n");
            for (description, output) in prerequisite_outputs {
                body.push_str(&format!("### {}\n{}\n\n", description, output));
            }
        }
        body.push_str("Your task:\n");
        body.push_str(&subtask.description);
        body.push_str("\n\n");
        body.push_str(&self.format_trailer());

        messages.push(ChatMessage::user(body));
        messages
    }

    /// Trailer instructing the model how to shape its answer.
    fn format_trailer(&self) -> String {
        if self.persona.dna.output_format.is_empty() {
            return "Respond with the deliverable only, no preamble.".to_string();
        }
        let mut trailer = String::from("Respond with the deliverable only, formatted as follows:\n");
        for (key, value) in &self.persona.dna.output_format {
            trailer.push_str(&format!("- {}: {}\n", key, value));
        }
        trailer
    }
}

/// Map a subtask domain onto the model-selection class.
pub fn task_class_for(domain: Domain) -> TaskClass {
    match domain {
        Domain::Development | Domain::Testing => TaskClass::Code,
        _ => TaskClass::General,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskweave::persona::PersonaDna;
    use async_trait::async_trait;
    use chrono::Utc;

    struct EchoClient;

    #[async_trait]
    impl InferenceClient for EchoClient {
        async fn chat(
            &self,
            _class: TaskClass,
            messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> EngineResult<String> {
            Ok(messages.last().unwrap().content.clone())
        }

        async fn chat_stream(
            &self,
            _class: TaskClass,
            _messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> EngineResult<crate::taskweave::inference::ChunkStream> {
            Ok(Box::pin(futures_util::stream::empty()))
        }

        async fn health(&self) -> EngineResult<()> {
            Ok(())
        }
    }

    fn persona() -> PersonaRecord {
        PersonaRecord {
            id: "p1".into(),
            dna: PersonaDna::default_for(Domain::Development, "senior backend developer"),
            created_at: Utc::now(),
            usage_count: 0,
            score: 0.5,
            last_used: None,
        }
    }

    #[tokio::test]
    async fn test_prompt_contains_prereqs_and_description() {
        let agent = Agent::new(persona(), Arc::new(EchoClient));
        let subtask = Subtask::new("t1", "implement the login endpoint", Domain::Development);
        let prereqs = vec![("design the API".to_string(), "use JWT".to_string())];
        let out = agent.run(&subtask, "", &[], &prereqs).await.unwrap();
        assert!(out.contains("implement the login endpoint"));
        assert!(out.contains("use JWT"));
        assert!(out.contains("design the API"));
    }

    #[test]
    fn test_code_domains_route_to_code_model() {
        assert_eq!(task_class_for(Domain::Development), TaskClass::Code);
        assert_eq!(task_class_for(Domain::Testing), TaskClass::Code);
        assert_eq!(task_class_for(Domain::Research), TaskClass::General);
    }
}
