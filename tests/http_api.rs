//! HTTP API Suite
//!
//! Exercises the consumer router in-process with `tower::ServiceExt::oneshot`,
//! with a scripted producer bound directly to the relay core.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

use chat_relay::relay::{ProducerBinding, RelayMessage};
use chat_relay::server::{api_router, AppState};
use chat_relay::{RelayConfig, RelayCore, RelayHandle};

fn setup() -> (RelayHandle, Router) {
    let config = RelayConfig {
        debounce: Duration::from_millis(50),
        max_generation: Duration::from_secs(10),
        ..RelayConfig::default()
    };
    let relay = RelayCore::spawn(&config);
    let app = api_router(AppState::new(relay.clone(), &config));
    (relay, app)
}

/// Answer every prompt with `answer` split into growing snapshots, then an
/// explicit completion.
fn spawn_scripted_producer(relay: RelayHandle, mut binding: ProducerBinding, answer: &'static str) {
    tokio::spawn(async move {
        while let Some(message) = binding.outbound.recv().await {
            let RelayMessage::StartGeneration { generation, .. } = message else { continue };
            let words: Vec<&str> = answer.split(' ').collect();
            for end in 1..=words.len() {
                let frame = json!({
                    "event": "fragment-update",
                    "message": words[..end].join(" "),
                    "generation": generation,
                });
                relay.producer_frame(binding.link, frame.to_string()).unwrap();
            }
            let done = json!({ "event": "generation-complete", "generation": generation });
            relay.producer_frame(binding.link, done.to_string()).unwrap();
        }
    });
}

fn chat(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_no_producer_returns_503() {
    let (relay, app) = setup();
    let response = app
        .oneshot(chat(json!({ "messages": [{ "role": "user", "content": "hello" }] })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(body["error"].as_str().unwrap().contains("not ready"));
    assert_eq!(relay.status().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_request_without_user_message_is_rejected() {
    let (relay, app) = setup();
    let _binding = relay.bind_producer().await.unwrap();
    let response = app
        .oneshot(chat(json!({ "messages": [{ "role": "system", "content": "be terse" }] })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(relay.status().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_aggregate_completion_end_to_end() {
    let (relay, app) = setup();
    let binding = relay.bind_producer().await.unwrap();
    spawn_scripted_producer(relay.clone(), binding, "Hi there, friend!");

    let response = app
        .oneshot(chat(json!({
            "model": "anything",
            "messages": [{ "role": "user", "content": "greet me" }]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["model"], "web-relay");
    assert_eq!(body["choices"][0]["message"]["content"], "Hi there, friend!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_streaming_completion_emits_deltas_and_done() {
    let (relay, app) = setup();
    let binding = relay.bind_producer().await.unwrap();
    spawn_scripted_producer(relay.clone(), binding, "one two three");

    let response = app
        .oneshot(chat(json!({
            "stream": true,
            "messages": [{ "role": "user", "content": "count" }]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let text = body_text(response).await;

    let payloads: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(payloads.last(), Some(&"[DONE]"));

    let chunks: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    let content: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "one two three");

    let last = chunks.last().unwrap();
    assert_eq!(last["object"], "chat.completion.chunk");
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert!(last["choices"][0]["delta"].get("content").is_none());
    assert!(chunks.iter().all(|c| c["id"] == chunks[0]["id"]));
}

#[tokio::test]
async fn test_health_reports_producer_state() {
    let (relay, app) = setup();
    let get_health = || Request::builder().uri("/health").body(Body::empty()).unwrap();

    let response = app.clone().oneshot(get_health()).await.unwrap();
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["producer_ready"], false);

    let _binding = relay.bind_producer().await.unwrap();
    let response = app.oneshot(get_health()).await.unwrap();
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["producer_ready"], true);
    assert_eq!(body["queued"], 0);
}

#[tokio::test]
async fn test_session_reset() {
    let (relay, app) = setup();
    let reset = || Request::builder().method("POST").uri("/v1/session/reset").body(Body::empty()).unwrap();

    let response = app.clone().oneshot(reset()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let mut binding = relay.bind_producer().await.unwrap();
    let response = app.clone().oneshot(reset()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(binding.outbound.recv().await, Some(RelayMessage::ResetSession));

    // Busy producer: the queued prompt owns the session.
    let _pending = relay.submit("hold", chat_relay::relay::ResponseMode::Aggregate).await.unwrap();
    let response = app.oneshot(reset()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
