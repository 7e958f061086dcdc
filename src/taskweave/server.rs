//! The HTTP front-end.
//!
//! Exposes the engine over a small JSON surface, all paths under `/api`:
//!
//! | Method | Path                      | Purpose |
//! |--------|---------------------------|---------|
//! | GET    | `/api/health`             | Liveness + backend reachability |
//! | POST   | `/api/task`               | Run a workflow end-to-end |
//! | POST   | `/api/stream/chat`        | Single-turn streaming chat |
//! | GET    | `/api/conversation/history` | Turn history for a session |
//! | GET    | `/api/stats`              | Persona / workflow counters |
//! | GET    | `/api/personas`           | Personas with scores |
//!
//! Validation is strict: strings are capped at 16 KiB and rejected on
//! control characters outside `\t\r\n`; path-shaped context values must
//! normalise to a subpath of the configured data directory. Cross-origin
//! requests are accepted only from loopback and private IPv4 ranges. Domain
//! failures ride inside a 200 workflow record — only malformed requests and
//! infrastructure failures produce non-2xx responses.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Component, Path};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::taskweave::error::{EngineError, EngineResult};
use crate::taskweave::inference::{ChatMessage, GenerationOptions, TaskClass};
use crate::taskweave::orchestrator::{Environment, Orchestrator};
use crate::taskweave::persona::PersonaFilter;
use crate::taskweave::task::{Turn, TurnRole};

/// Maximum accepted length for any string field, in bytes.
pub const MAX_STRING_BYTES: usize = 16 * 1024;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub env: Arc<Environment>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(env: Arc<Environment>) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&env)));
        Self { env, orchestrator }
    }
}

/// Build the router with every `/api` route wired up. Every route also
/// answers CORS preflight.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health).options(preflight))
        .route("/api/task", post(run_task).options(preflight))
        .route("/api/stream/chat", post(stream_chat).options(preflight))
        .route(
            "/api/conversation/history",
            get(conversation_history).options(preflight),
        )
        .route("/api/stats", get(stats).options(preflight))
        .route("/api/personas", get(personas).options(preflight))
        .with_state(state)
}

/// CORS preflight: allow loopback and private-range origins, reject the
/// rest before any method runs.
async fn preflight(headers: HeaderMap) -> Response {
    match cors_check(&headers) {
        Ok(origin) => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            response.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                "GET, POST, OPTIONS".parse().expect("static header value"),
            );
            response.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "content-type".parse().expect("static header value"),
            );
            with_cors(response, origin)
        }
        Err(rejection) => rejection,
    }
}

/// Bind the listening socket. Kept separate from [`serve`] so the binary can
/// exit with a distinct code on bind failure.
pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{}", e)))?;
    TcpListener::bind(addr).await
}

/// Serve until the shutdown future resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

// ── CORS ────────────────────────────────────────────────────────────────────

/// Whether an `Origin` header value is acceptable: loopback, `localhost`,
/// or the private IPv4 ranges `10/8`, `172.16/12`, `192.168/16`.
pub fn origin_allowed(origin: &str) -> bool {
    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    // Bracketed IPv6 hosts keep their brackets in the authority.
    let host = if let Some(stripped) = rest.strip_prefix('[') {
        stripped.split(']').next().unwrap_or("")
    } else {
        rest.split(['/', ':']).next().unwrap_or("")
    };
    if host.is_empty() {
        return false;
    }
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_loopback() || ipv4_private(v4),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}

fn ipv4_private(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

/// Reject disallowed cross-origin requests; echo the origin back otherwise.
fn cors_check(headers: &HeaderMap) -> Result<Option<String>, Response> {
    match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        None => Ok(None),
        Some(origin) if origin_allowed(origin) => Ok(Some(origin.to_string())),
        Some(origin) => {
            log::warn!("rejected cross-origin request from {}", origin);
            Err((
                StatusCode::FORBIDDEN,
                Json(json!({"error": {"code": "validation_error", "message": "origin not allowed"}})),
            )
                .into_response())
        }
    }
}

fn with_cors(mut response: Response, origin: Option<String>) -> Response {
    if let Some(origin) = origin {
        if let Ok(value) = origin.parse() {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    response
}

// ── Validation ──────────────────────────────────────────────────────────────

/// Strict string validation: byte cap plus control-character rejection.
pub fn validate_text(field: &str, value: &str) -> EngineResult<()> {
    if value.len() > MAX_STRING_BYTES {
        return Err(EngineError::Validation(format!(
            "{} exceeds {} bytes",
            field, MAX_STRING_BYTES
        )));
    }
    if value
        .chars()
        .any(|c| c.is_control() && c != '\t' && c != '\r' && c != '\n')
    {
        return Err(EngineError::Validation(format!(
            "{} contains control characters",
            field
        )));
    }
    Ok(())
}

/// File-path fields must normalise to a subpath of `base`: relative, no
/// parent components, and no traversal once joined.
pub fn validate_subpath(field: &str, value: &str, base: &Path) -> EngineResult<()> {
    validate_text(field, value)?;
    let candidate = Path::new(value);
    if candidate.is_absolute() {
        return Err(EngineError::Validation(format!(
            "{} must be a relative path",
            field
        )));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(EngineError::Validation(format!(
                    "{} escapes the base directory",
                    field
                )))
            }
        }
    }
    // Symlinks may only escape once the target exists; resolve and re-check.
    let joined = base.join(candidate);
    if joined.exists() {
        let resolved = joined
            .canonicalize()
            .map_err(|e| EngineError::Validation(format!("{}: {}", field, e)))?;
        let base_resolved = base
            .canonicalize()
            .map_err(|e| EngineError::Validation(format!("{}: {}", field, e)))?;
        if !resolved.starts_with(&base_resolved) {
            return Err(EngineError::Validation(format!(
                "{} escapes the base directory",
                field
            )));
        }
    }
    Ok(())
}

fn validate_session_id(value: &str) -> EngineResult<()> {
    if value.is_empty() || value.len() > 128 {
        return Err(EngineError::Validation("session_id length invalid".into()));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EngineError::Validation(
            "session_id may only contain [A-Za-z0-9_-]".into(),
        ));
    }
    Ok(())
}

fn validate_context(context: &BTreeMap<String, String>, base: &Path) -> EngineResult<()> {
    for (key, value) in context {
        validate_text("context key", key)?;
        if key == "path" || key.ends_with("_path") {
            validate_subpath(key, value, base)?;
        } else {
            validate_text(key, value)?;
        }
    }
    Ok(())
}

fn error_response(err: &EngineError) -> Response {
    let status = match err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::Decomposition(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::InferenceTimeout
        | EngineError::InferenceUnreachable(_)
        | EngineError::InferenceBackend { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"error": {"code": err.code(), "message": err.to_string()}})),
    )
        .into_response()
}

// ── Handlers ────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let origin = match cors_check(&headers) {
        Ok(origin) => origin,
        Err(rejection) => return rejection,
    };
    let backend = match state.env.inference.health().await {
        Ok(()) => "reachable",
        Err(e) => {
            log::warn!("inference backend probe failed: {}", e);
            "unreachable"
        }
    };
    let body = Json(json!({
        "status": "ok",
        "backend": backend,
        "timestamp": chrono::Utc::now(),
    }));
    with_cors((StatusCode::OK, body).into_response(), origin)
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    task: String,
    #[serde(default)]
    context: BTreeMap<String, String>,
    #[serde(default)]
    use_orchestrator: Option<bool>,
}

async fn run_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TaskRequest>,
) -> Response {
    let origin = match cors_check(&headers) {
        Ok(origin) => origin,
        Err(rejection) => return rejection,
    };
    if request.task.trim().is_empty() {
        return with_cors(
            error_response(&EngineError::Validation("task must not be empty".into())),
            origin,
        );
    }
    if let Err(e) = validate_text("task", &request.task) {
        return with_cors(error_response(&e), origin);
    }
    if let Err(e) = validate_context(&request.context, &state.env.config.data_dir) {
        return with_cors(error_response(&e), origin);
    }

    let record = if request.use_orchestrator.unwrap_or(true) {
        match state
            .orchestrator
            .execute(&request.task, request.context, None)
            .await
        {
            Ok(record) => record,
            Err(e) => return with_cors(error_response(&e), origin),
        }
    } else {
        state
            .orchestrator
            .execute_direct(&request.task, request.context)
            .await
    };
    with_cors((StatusCode::OK, Json(record)).into_response(), origin)
}

#[derive(Debug, Deserialize)]
struct StreamChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

async fn stream_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StreamChatRequest>,
) -> Response {
    let origin = match cors_check(&headers) {
        Ok(origin) => origin,
        Err(rejection) => return rejection,
    };
    if let Err(e) = validate_text("message", &request.message) {
        return with_cors(error_response(&e), origin);
    }
    let session_id = request.session_id.unwrap_or_else(|| "default".to_string());
    if let Err(e) = validate_session_id(&session_id) {
        return with_cors(error_response(&e), origin);
    }

    // Prompt = prior window + the new user turn.
    let history = state.env.sessions.history(&session_id).await;
    let mut messages: Vec<ChatMessage> = Vec::with_capacity(history.len() + 1);
    for turn in &history {
        match turn.role {
            TurnRole::User => messages.push(ChatMessage::user(turn.text.clone())),
            TurnRole::Assistant => messages.push(ChatMessage::assistant(turn.text.clone())),
        }
    }
    messages.push(ChatMessage::user(request.message.clone()));

    state
        .env
        .sessions
        .append(&session_id, Turn::user(request.message.clone()))
        .await;

    let chunks = match state
        .env
        .inference
        .chat_stream(TaskClass::Conversation, &messages, &GenerationOptions::default())
        .await
    {
        Ok(chunks) => chunks,
        Err(e) => return with_cors(error_response(&e), origin),
    };

    // One JSON object per chunk, blank-line terminated, then {done, final}.
    struct StreamState {
        chunks: crate::taskweave::inference::ChunkStream,
        sessions: Arc<crate::taskweave::memory::SessionMemory>,
        session_id: String,
        accumulated: String,
        finished: bool,
    }

    let stream_state = StreamState {
        chunks,
        sessions: Arc::clone(&state.env.sessions),
        session_id,
        accumulated: String::new(),
        finished: false,
    };

    let body_stream = futures_util::stream::unfold(stream_state, |mut st| async move {
        if st.finished {
            return None;
        }
        match st.chunks.next().await {
            Some(Ok(delta)) => {
                st.accumulated.push_str(&delta);
                let chunk = format!("{}\n\n", json!({ "delta": delta }));
                Some((Ok::<String, std::convert::Infallible>(chunk), st))
            }
            Some(Err(e)) => {
                st.finished = true;
                let chunk = format!(
                    "{}\n\n",
                    json!({"error": {"code": e.code(), "message": e.to_string()}})
                );
                Some((Ok(chunk), st))
            }
            None => {
                st.finished = true;
                st.sessions
                    .append(&st.session_id, Turn::assistant(st.accumulated.clone()))
                    .await;
                let chunk = format!("{}\n\n", json!({"done": true, "final": st.accumulated}));
                Some((Ok(chunk), st))
            }
        }
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    with_cors(response, origin)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    session: Option<String>,
    session_id: Option<String>,
}

async fn conversation_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let origin = match cors_check(&headers) {
        Ok(origin) => origin,
        Err(rejection) => return rejection,
    };
    let session_id = query
        .session
        .or(query.session_id)
        .unwrap_or_else(|| "default".to_string());
    if let Err(e) = validate_session_id(&session_id) {
        return with_cors(error_response(&e), origin);
    }
    let turns = state.env.sessions.history(&session_id).await;
    with_cors(
        (StatusCode::OK, Json(json!({ "turns": turns }))).into_response(),
        origin,
    )
}

async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let origin = match cors_check(&headers) {
        Ok(origin) => origin,
        Err(rejection) => return rejection,
    };
    let personas = state.env.personas.list(&PersonaFilter::default()).await;
    let persona_scores: Vec<serde_json::Value> = personas
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "role": p.dna.role,
                "score": p.score,
                "uses": p.usage_count,
            })
        })
        .collect();
    let body = Json(json!({
        "personas": personas.len(),
        "workflows": state.env.long_term.resident_count().await,
        "tracked_tasks": state.env.tracker.task_count().await,
        "persona_scores": persona_scores,
    }));
    with_cors((StatusCode::OK, body).into_response(), origin)
}

async fn personas(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let origin = match cors_check(&headers) {
        Ok(origin) => origin,
        Err(rejection) => return rejection,
    };
    let records = state.env.personas.list(&PersonaFilter::default()).await;
    let body: Vec<serde_json::Value> = records
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "role": p.dna.role,
                "domain": p.dna.domain,
                "score": p.score,
                "uses": p.usage_count,
                "last_used": p.last_used,
            })
        })
        .collect();
    with_cors((StatusCode::OK, Json(body)).into_response(), origin)
}
