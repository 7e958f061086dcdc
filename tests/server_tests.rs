use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use taskweave::error::{EngineError, EngineResult};
use taskweave::inference::{ChatMessage, ChunkStream, GenerationOptions, InferenceClient, TaskClass};
use taskweave::orchestrator::Environment;
use taskweave::server::{self, AppState};
use taskweave::EngineConfig;

struct MockClient {
    response: String,
}

#[async_trait]
impl InferenceClient for MockClient {
    async fn chat(
        &self,
        _class: TaskClass,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> EngineResult<String> {
        Ok(self.response.clone())
    }

    async fn chat_stream(
        &self,
        _class: TaskClass,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> EngineResult<ChunkStream> {
        let words: Vec<String> = self
            .response
            .split_whitespace()
            .map(|w| format!("{} ", w))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(
            words.into_iter().map(Ok),
        )))
    }

    async fn health(&self) -> EngineResult<()> {
        Ok(())
    }
}

struct UnreachableClient;

#[async_trait]
impl InferenceClient for UnreachableClient {
    async fn chat(
        &self,
        _class: TaskClass,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> EngineResult<String> {
        Err(EngineError::InferenceUnreachable("connection refused".into()))
    }

    async fn chat_stream(
        &self,
        _class: TaskClass,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> EngineResult<ChunkStream> {
        Err(EngineError::InferenceUnreachable("connection refused".into()))
    }

    async fn health(&self) -> EngineResult<()> {
        Err(EngineError::InferenceUnreachable("connection refused".into()))
    }
}

fn http() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client builds")
}

struct RunningServer {
    addr: SocketAddr,
    _shutdown: tokio::sync::oneshot::Sender<()>,
    _dir: tempfile::TempDir,
}

async fn start_server(client: Arc<dyn InferenceClient>) -> RunningServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.data_dir = dir.path().to_path_buf();
    let env = Arc::new(Environment::new(config, client).unwrap());
    let state = AppState::new(env);

    let listener = server::bind("127.0.0.1", 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(server::serve(listener, state, async move {
        let _ = rx.await;
    }));

    RunningServer {
        addr,
        _shutdown: tx,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_health_reports_backend_state() {
    let up = start_server(Arc::new(MockClient {
        response: "hi".into(),
    }))
    .await;
    let http = http();

    let body: serde_json::Value = http
        .get(format!("http://{}/api/health", up.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "reachable");

    let down = start_server(Arc::new(UnreachableClient)).await;
    let body: serde_json::Value = http
        .get(format!("http://{}/api/health", down.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["backend"], "unreachable");
}

#[tokio::test]
async fn test_task_endpoint_runs_a_workflow() {
    let running = start_server(Arc::new(MockClient {
        response: "Hello there!".into(),
    }))
    .await;
    let http = http();

    let response = http
        .post(format!("http://{}/api/task", running.addr))
        .json(&serde_json::json!({"task": "say hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let record: serde_json::Value = response.json().await.unwrap();
    assert_eq!(record["status"], "ok");
    assert!(!record["aggregated"].as_str().unwrap().is_empty());
    assert_eq!(record["results"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_offline_backend_is_a_failed_subtask_not_an_http_error() {
    let running = start_server(Arc::new(UnreachableClient)).await;
    let http = http();

    let response = http
        .post(format!("http://{}/api/task", running.addr))
        .json(&serde_json::json!({"task": "say hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let record: serde_json::Value = response.json().await.unwrap();
    assert_eq!(record["status"], "partial");
    let results = record["results"].as_array().unwrap();
    assert_eq!(results[0]["state"], "failed");
    assert_eq!(results[0]["failure_reason"], "InferenceUnreachable");
}

#[tokio::test]
async fn test_cors_policy_over_the_wire() {
    let running = start_server(Arc::new(MockClient {
        response: "hi".into(),
    }))
    .await;
    let http = http();

    let rejected = http
        .get(format!("http://{}/api/health", running.addr))
        .header("origin", "http://8.8.8.8")
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 403);

    let preflight_rejected = http
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{}/api/task", running.addr),
        )
        .header("origin", "http://8.8.8.8")
        .send()
        .await
        .unwrap();
    assert_eq!(preflight_rejected.status(), 403);

    let accepted = http
        .get(format!("http://{}/api/health", running.addr))
        .header("origin", "http://192.168.1.10")
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 200);
    assert_eq!(
        accepted
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "http://192.168.1.10"
    );
}

#[tokio::test]
async fn test_validation_rejects_control_characters() {
    let running = start_server(Arc::new(MockClient {
        response: "hi".into(),
    }))
    .await;
    let http = http();

    let response = http
        .post(format!("http://{}/api/task", running.addr))
        .json(&serde_json::json!({"task": "say \u{0} hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_path_fields_are_sandboxed() {
    let running = start_server(Arc::new(MockClient {
        response: "hi".into(),
    }))
    .await;
    let http = http();

    let response = http
        .post(format!("http://{}/api/task", running.addr))
        .json(&serde_json::json!({
            "task": "say hi",
            "context": {"notes_path": "../../etc/passwd"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_stats_and_personas_after_a_run() {
    let running = start_server(Arc::new(MockClient {
        response: "done".into(),
    }))
    .await;
    let http = http();

    http.post(format!("http://{}/api/task", running.addr))
        .json(&serde_json::json!({"task": "say hi"}))
        .send()
        .await
        .unwrap();

    let stats: serde_json::Value = http
        .get(format!("http://{}/api/stats", running.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["workflows"], 1);
    assert!(stats["personas"].as_u64().unwrap() >= 1);

    let personas: serde_json::Value = http
        .get(format!("http://{}/api/personas", running.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let list = personas.as_array().unwrap();
    assert!(!list.is_empty());
    assert!(list[0]["role"].as_str().is_some());
    assert!(list[0]["uses"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_stream_chat_then_history() {
    let running = start_server(Arc::new(MockClient {
        response: "streamed reply".into(),
    }))
    .await;
    let http = http();

    for i in 0..3 {
        let response = http
            .post(format!("http://{}/api/stream/chat", running.addr))
            .json(&serde_json::json!({"message": format!("question {}", i), "session_id": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = response.text().await.unwrap();
        let chunks: Vec<serde_json::Value> = body
            .split("\n\n")
            .filter(|c| !c.trim().is_empty())
            .map(|c| serde_json::from_str(c).unwrap())
            .collect();
        assert!(chunks.len() >= 2);
        let last = chunks.last().unwrap();
        assert_eq!(last["done"], true);
        assert_eq!(last["final"], "streamed reply ");
    }

    let history: serde_json::Value = http
        .get(format!(
            "http://{}/api/conversation/history?session=x",
            running.addr
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let turns = history["turns"].as_array().unwrap();
    assert_eq!(turns.len(), 6);
    for i in 0..3 {
        assert_eq!(turns[2 * i]["role"], "user");
        assert_eq!(turns[2 * i]["text"], format!("question {}", i));
        assert_eq!(turns[2 * i + 1]["role"], "assistant");
    }
}
