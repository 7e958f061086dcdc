use std::time::Duration;

use taskweave::error::EngineError;
use taskweave::inference::{
    ChatMessage, GenerationOptions, InferenceClient, LocalInferenceClient, TaskClass,
    CONNECT_TIMEOUT, REQUEST_TIMEOUT,
};

#[test]
fn test_published_timeouts() {
    assert_eq!(CONNECT_TIMEOUT, Duration::from_secs(5));
    assert_eq!(REQUEST_TIMEOUT, Duration::from_secs(120));
    let client = LocalInferenceClient::new("http://localhost:11434");
    assert_eq!(client.request_timeout(), REQUEST_TIMEOUT);
}

#[tokio::test]
async fn test_silent_backend_times_out() {
    // A listener that accepts connections and then says nothing.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            // Hold the socket open without responding.
            tokio::spawn(async move {
                let _socket = socket;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    let client = LocalInferenceClient::with_timeouts(
        format!("http://{}", addr),
        Duration::from_secs(1),
        Duration::from_millis(300),
    );
    let err = client
        .chat(
            TaskClass::Conversation,
            &[ChatMessage::user("hello")],
            &GenerationOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, EngineError::InferenceTimeout),
        "expected timeout, got {:?}",
        err
    );
}

#[tokio::test]
async fn test_refused_connection_is_unreachable() {
    // Bind and immediately drop to find a port nothing listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = LocalInferenceClient::with_timeouts(
        format!("http://127.0.0.1:{}", port),
        Duration::from_secs(1),
        Duration::from_secs(2),
    );
    let err = client.health().await.unwrap_err();
    assert!(
        matches!(err, EngineError::InferenceUnreachable(_)),
        "expected unreachable, got {:?}",
        err
    );
}

#[tokio::test]
async fn test_backend_error_preserves_status_and_message() {
    // Minimal HTTP server answering 500 with a body.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = "model exploded";
                let response = format!(
                    "HTTP/1.1 500 Internal Server Error\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    let client = LocalInferenceClient::with_timeouts(
        format!("http://{}", addr),
        Duration::from_secs(1),
        Duration::from_secs(2),
    );
    let err = client
        .chat(
            TaskClass::General,
            &[ChatMessage::user("boom")],
            &GenerationOptions::default(),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::InferenceBackend { status, message } => {
            assert_eq!(status, 500);
            assert!(message.contains("model exploded"));
        }
        other => panic!("expected backend error, got {:?}", other),
    }
}
