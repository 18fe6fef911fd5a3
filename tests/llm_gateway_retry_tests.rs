//! `GatewayLlmClient` against a real HTTP server (via `mockito`): a
//! persistently unavailable gateway exhausts its retry budget and surfaces
//! `LlmError::Unavailable`, while a healthy gateway succeeds on the first
//! attempt.

use roundtable_core::error::LlmError;
use roundtable_core::llm_client::{GatewayLlmClient, LlmClient, Message, RetryPolicy};
use std::time::Duration;

#[tokio::test]
async fn persistent_503_exhausts_retries_and_surfaces_unavailable() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(503)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"overloaded"}"#)
        .expect(3)
        .create_async()
        .await;

    let client = GatewayLlmClient::new(server.url(), "test-key", "test-model").with_retry_policy(RetryPolicy {
        initial_backoff: Duration::from_millis(5),
        max_attempts: 3,
    });

    let err = client.send(&[Message::user("hi")], &[]).await.unwrap_err();
    assert!(matches!(err, LlmError::Unavailable(_)));
    mock.assert_async().await;
}

#[tokio::test]
async fn healthy_gateway_succeeds_on_first_attempt() {
    let mut server = mockito::Server::new_async().await;
    let body = serde_json::json!({
        "choices": [{"message": {"content": "all clear"}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 4}
    });
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .expect(1)
        .create_async()
        .await;

    let client = GatewayLlmClient::new(server.url(), "test-key", "test-model");
    let (message, usage) = client.send(&[Message::user("hi")], &[]).await.unwrap();
    assert_eq!(message.content.as_ref(), "all clear");
    assert_eq!(usage.total_tokens, 14);
    mock.assert_async().await;
}
