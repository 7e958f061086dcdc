//! Narrow adapter over the local model-serving endpoint.
//!
//! The engine never talks to the inference server directly — every call goes
//! through the [`InferenceClient`] trait so tests can substitute fakes and so
//! the wire protocol stays in one place. The bundled [`LocalInferenceClient`]
//! speaks the Ollama chat protocol (`POST /api/chat`, NDJSON streaming,
//! `GET /api/tags` for reachability and the installed-model list).
//!
//! Callers pass a [`TaskClass`]; the client resolves the concrete model name
//! and falls back in [`MODEL_FALLBACK_ORDER`] when the preferred model is not
//! installed, logging the substitution.
//!
//! # Timeouts
//!
//! Connect timeout 5 s, total request timeout 120 s. A timeout surfaces as
//! [`EngineError::InferenceTimeout`], a refused or failed connection as
//! [`EngineError::InferenceUnreachable`], and any non-2xx status as
//! [`EngineError::InferenceBackend`] carrying the backend's message.

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::taskweave::error::{EngineError, EngineResult};

/// Default connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default total request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Published fallback order when a preferred model is not installed.
pub const MODEL_FALLBACK_ORDER: [&str; 3] = ["llama3.1:8b", "llama3.2:3b", "qwen2.5-coder:7b"];

/// Broad class of work a prompt represents, used for model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    /// Code-heavy subtasks route to a code-capable model.
    Code,
    /// Single-turn chat routes to a small fast model.
    Conversation,
    /// Everything else.
    General,
}

impl TaskClass {
    /// Preferred model name for this class.
    pub fn preferred_model(&self) -> &'static str {
        match self {
            TaskClass::Code => "qwen2.5-coder:7b",
            TaskClass::Conversation => "llama3.2:3b",
            TaskClass::General => "llama3.1:8b",
        }
    }
}

/// Role of a chat message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single chat message sent to the model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters forwarded to the backend. Unset fields are omitted
/// from the request so the backend's own defaults apply.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
}

/// Stream of response text deltas.
pub type ChunkStream = Pin<Box<dyn Stream<Item = EngineResult<String>> + Send>>;

/// Trait-driven abstraction over the model endpoint.
///
/// Implementations must be thread-safe so agents dispatched in parallel can
/// share one client. Tests provide fakes; see the orchestrator tests.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Full request/response chat completion. The client resolves the model
    /// name from `class`.
    async fn chat(
        &self,
        class: TaskClass,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> EngineResult<String>;

    /// Streaming chat completion yielding text deltas.
    async fn chat_stream(
        &self,
        class: TaskClass,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> EngineResult<ChunkStream>;

    /// Probe backend reachability. `Ok(())` means the endpoint answered.
    async fn health(&self) -> EngineResult<()>;
}

// ── Wire shapes (Ollama chat protocol) ──────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: &'a GenerationOptions,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatMessageWire>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct ChatMessageWire {
    #[allow(dead_code)]
    role: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

/// HTTP client for a local Ollama-compatible endpoint.
///
/// # Example
///
/// ```rust,no_run
/// use taskweave::inference::{ChatMessage, GenerationOptions, InferenceClient, LocalInferenceClient, TaskClass};
///
/// # async fn example() -> Result<(), taskweave::error::EngineError> {
/// let client = LocalInferenceClient::new("http://localhost:11434");
/// let reply = client
///     .chat(
///         TaskClass::Conversation,
///         &[ChatMessage::user("Say hi")],
///         &GenerationOptions::default(),
///     )
///     .await?;
/// println!("{}", reply);
/// # Ok(())
/// # }
/// ```
pub struct LocalInferenceClient {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    /// Installed models as last reported by the backend. `None` until the
    /// first successful refresh; model resolution then prefers installed
    /// names and falls back in the published order.
    installed: RwLock<Option<Vec<String>>>,
}

impl LocalInferenceClient {
    /// Create a client with the default 5 s / 120 s timeouts.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeouts(base_url, CONNECT_TIMEOUT, REQUEST_TIMEOUT)
    }

    /// Create a client with explicit timeouts. Exposed so tests can exercise
    /// the timeout path without waiting two minutes.
    pub fn with_timeouts(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            request_timeout,
            installed: RwLock::new(None),
        }
    }

    /// The total request timeout this client enforces.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Resolve the concrete model name for a class, honouring the installed
    /// list when known. A fallback is logged once per call.
    pub async fn resolve_model(&self, class: TaskClass) -> String {
        let preferred = class.preferred_model();
        let installed = self.installed.read().await;
        match installed.as_ref() {
            Some(names) if !names.is_empty() => {
                if names.iter().any(|n| n == preferred) {
                    return preferred.to_string();
                }
                for candidate in MODEL_FALLBACK_ORDER.iter() {
                    if names.iter().any(|n| n == candidate) {
                        log::warn!(
                            "model '{}' not installed, falling back to '{}'",
                            preferred,
                            candidate
                        );
                        return candidate.to_string();
                    }
                }
                // Nothing from the published order is installed; let the
                // backend pick its own error for the preferred name.
                preferred.to_string()
            }
            _ => preferred.to_string(),
        }
    }

    /// Refresh the installed-model list from `GET /api/tags`.
    pub async fn refresh_models(&self) -> EngineResult<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(map_transport_error)?;
        let resp = check_status(resp).await?;
        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::InferenceBackend {
                status: 200,
                message: format!("invalid tags payload: {}", e),
            })?;
        let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        *self.installed.write().await = Some(names.clone());
        Ok(names)
    }
}

/// Map reqwest transport errors onto the engine taxonomy.
fn map_transport_error(err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::InferenceTimeout
    } else {
        EngineError::InferenceUnreachable(err.to_string())
    }
}

/// Reject non-2xx responses with the backend's own message preserved.
async fn check_status(resp: reqwest::Response) -> EngineResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(EngineError::InferenceBackend {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl InferenceClient for LocalInferenceClient {
    async fn chat(
        &self,
        class: TaskClass,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> EngineResult<String> {
        let model = self.resolve_model(class).await;
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &model,
            messages,
            stream: false,
            options,
        };
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let resp = check_status(resp).await?;
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::InferenceBackend {
                status: 200,
                message: format!("invalid chat payload: {}", e),
            })?;
        Ok(parsed
            .message
            .and_then(|m| m.content)
            .unwrap_or_default())
    }

    async fn chat_stream(
        &self,
        class: TaskClass,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> EngineResult<ChunkStream> {
        let model = self.resolve_model(class).await;
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &model,
            messages,
            stream: true,
            options,
        };
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let resp = check_status(resp).await?;

        // NDJSON: one ChatResponse per line, terminated by a done=true line.
        struct DecodeState {
            inner: Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>,
            buf: String,
            finished: bool,
        }

        let state = DecodeState {
            inner: Box::pin(resp.bytes_stream().map(|r| r.map(|b| b.to_vec()))),
            buf: String::new(),
            finished: false,
        };

        let stream = futures_util::stream::unfold(state, |mut st| async move {
            loop {
                if st.finished {
                    return None;
                }
                if let Some(pos) = st.buf.find('\n') {
                    let line: String = st.buf.drain(..=pos).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ChatResponse>(line) {
                        Ok(chunk) => {
                            let delta = chunk
                                .message
                                .and_then(|m| m.content)
                                .unwrap_or_default();
                            if chunk.done {
                                st.finished = true;
                                if delta.is_empty() {
                                    return None;
                                }
                            }
                            if delta.is_empty() {
                                continue;
                            }
                            return Some((Ok(delta), st));
                        }
                        Err(e) => {
                            st.finished = true;
                            return Some((
                                Err(EngineError::InferenceBackend {
                                    status: 200,
                                    message: format!("invalid stream chunk: {}", e),
                                }),
                                st,
                            ));
                        }
                    }
                }
                match st.inner.next().await {
                    Some(Ok(bytes)) => {
                        st.buf.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        return Some((Err(map_transport_error(e)), st));
                    }
                    None => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn health(&self) -> EngineResult<()> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(map_transport_error)?;
        check_status(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let client = LocalInferenceClient::new("http://localhost:11434");
        assert_eq!(client.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_preferred_models() {
        assert_eq!(TaskClass::Code.preferred_model(), "qwen2.5-coder:7b");
        assert_eq!(TaskClass::Conversation.preferred_model(), "llama3.2:3b");
        assert_eq!(TaskClass::General.preferred_model(), "llama3.1:8b");
    }

    #[tokio::test]
    async fn test_resolve_model_falls_back_when_not_installed() {
        let client = LocalInferenceClient::new("http://localhost:11434");
        *client.installed.write().await = Some(vec!["llama3.2:3b".to_string()]);
        let resolved = client.resolve_model(TaskClass::Code).await;
        assert_eq!(resolved, "llama3.2:3b");
    }

    #[tokio::test]
    async fn test_resolve_model_keeps_preferred_when_installed() {
        let client = LocalInferenceClient::new("http://localhost:11434");
        *client.installed.write().await =
            Some(vec!["qwen2.5-coder:7b".to_string(), "llama3.1:8b".to_string()]);
        let resolved = client.resolve_model(TaskClass::Code).await;
        assert_eq!(resolved, "qwen2.5-coder:7b");
    }

    #[test]
    fn test_options_skip_unset_fields() {
        let opts = GenerationOptions {
            temperature: Some(0.2),
            ..Default::default()
        };
        let json = serde_json::to_string(&opts).unwrap();
        assert_eq!(json, r#"{"temperature":0.2}"#);
    }
}
