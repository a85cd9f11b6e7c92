use axum::{
    extract::{Json, State, ws::{WebSocket, WebSocketUpgrade, Message as WsMessage}},
    response::{IntoResponse, Response, sse::{Event, KeepAlive, Sse}},
    routing::{get, post},
    Router,
};
use axum::http::{header, StatusCode};
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::{CompletionReason, Completion, ConsumerResponse, RelayCore, RelayHandle, RelayStatus, ResponseMode, StreamItem, WireDialect};

// --- Error Handling ---
pub struct ServerError(anyhow::Error);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let relay_err = self.0.downcast_ref::<RelayError>();
        let status = match relay_err {
            Some(RelayError::ProducerUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
            Some(RelayError::ProducerDisconnected { .. }) => StatusCode::BAD_GATEWAY,
            Some(RelayError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            Some(RelayError::GenerationInProgress) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = serde_json::json!({ "error": self.0.to_string() });
        if let Some(partial) = relay_err.and_then(RelayError::partial_text) {
            body["partial"] = serde_json::Value::String(partial.to_string());
        }
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for ServerError where E: Into<anyhow::Error> {
    fn from(err: E) -> Self { Self(err.into()) }
}

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    pub model_name: String,
    pub dialect: WireDialect,
}

impl AppState {
    pub fn new(relay: RelayHandle, config: &RelayConfig) -> Self {
        Self { relay, model_name: config.model_name.clone(), dialect: config.dialect }
    }
}

// --- Consumer API schema ---

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Plain string, or the array-of-parts form newer clients send.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| part.kind == "text")
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl ChatRequest {
    /// Only the most recent user turn is forwarded; the producer keeps its
    /// own conversation.
    pub fn latest_user_prompt(&self) -> Result<String, RelayError> {
        let message = self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .ok_or_else(|| RelayError::InvalidRequest("no message with role 'user'".to_string()))?;

        let prompt = message.content.as_ref().map(MessageContent::to_text).unwrap_or_default();
        if prompt.trim().is_empty() {
            return Err(RelayError::InvalidRequest("latest user message is empty".to_string()));
        }
        Ok(prompt)
    }
}

#[derive(Serialize)]
struct ChatCompletion {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<Choice>,
}

#[derive(Serialize)]
struct Choice {
    index: u32,
    message: AssistantMessage,
    finish_reason: &'static str,
}

#[derive(Serialize)]
struct AssistantMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionChunk<'a> {
    id: &'a str,
    object: &'static str,
    created: i64,
    model: &'a str,
    choices: Vec<ChunkChoice>,
}

#[derive(Serialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    index: u32,
    finish_reason: Option<&'static str>,
}

#[derive(Serialize)]
struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

fn finish_reason(reason: CompletionReason) -> &'static str {
    if reason.is_truncated() { "length" } else { "stop" }
}

impl ChatCompletion {
    fn new(id: String, created: i64, model: String, completion: Completion) -> Self {
        Self {
            id,
            object: "chat.completion",
            created,
            model,
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage { role: "assistant", content: completion.text },
                finish_reason: finish_reason(completion.reason),
            }],
        }
    }
}

/// Renders stream items as OpenAI-style SSE events for one consumer.
struct ChunkEncoder {
    id: String,
    created: i64,
    model: String,
}

impl ChunkEncoder {
    fn chunk(&self, content: Option<String>, finish: Option<&'static str>) -> Option<Event> {
        let chunk = ChatCompletionChunk {
            id: &self.id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            choices: vec![ChunkChoice { delta: ChunkDelta { content }, index: 0, finish_reason: finish }],
        };
        match Event::default().json_data(&chunk) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(consumer = %self.id, "Failed to encode chunk: {}", err);
                None
            }
        }
    }

    fn events(&self, item: StreamItem) -> Vec<Event> {
        match item {
            StreamItem::Delta(text) => self.chunk(Some(text), None).into_iter().collect(),
            StreamItem::Finished(reason) => {
                let mut events: Vec<Event> = self.chunk(None, Some(finish_reason(reason))).into_iter().collect();
                events.push(Event::default().data("[DONE]"));
                events
            }
            StreamItem::Failed(err) => {
                let body = serde_json::json!({ "error": { "message": err.to_string() } });
                vec![Event::default().data(body.to_string()), Event::default().data("[DONE]")]
            }
        }
    }
}

fn stream_response(encoder: ChunkEncoder, chunks: mpsc::UnboundedReceiver<StreamItem>) -> Response {
    let events = UnboundedReceiverStream::new(chunks)
        .flat_map(move |item| futures_util::stream::iter(encoder.events(item)))
        .map(Ok::<_, Infallible>);

    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

// --- Routers ---

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/session/reset", post(reset_session))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The userscript connects to the bare host (`ws://localhost:8080`).
pub fn producer_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(producer_ws_handler))
        .route("/ws", get(producer_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: RelayConfig) -> Result<()> {
    let relay = RelayCore::spawn(&config);
    let state = AppState::new(relay, &config);

    let api_listener = tokio::net::TcpListener::bind(config.http_addr).await
        .with_context(|| format!("Failed to bind consumer API on {}", config.http_addr))?;
    let producer_listener = tokio::net::TcpListener::bind(config.producer_addr).await
        .with_context(|| format!("Failed to bind producer socket on {}", config.producer_addr))?;

    info!("🚀 Consumer API ready: http://{}", config.http_addr);
    info!("🔌 Producer socket ready: ws://{}", config.producer_addr);

    let api = axum::serve(api_listener, api_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal());
    let producer = axum::serve(producer_listener, producer_router(state))
        .with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { api.await.context("Consumer API server failed") },
        async { producer.await.context("Producer socket server failed") },
    )?;

    info!("👋 Relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct Health {
    status: &'static str,
    #[serde(flatten)]
    relay: RelayStatus,
}

async fn health(State(state): State<AppState>) -> Result<Json<Health>, ServerError> {
    let relay = state.relay.status().await?;
    Ok(Json(Health { status: "ok", relay }))
}

async fn reset_session(State(state): State<AppState>) -> Result<impl IntoResponse, ServerError> {
    state.relay.reset_session().await?;
    Ok((StatusCode::OK, Json(serde_json::json!({ "status": "reset" }))))
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ServerError> {
    let prompt = req.latest_user_prompt()?;
    let mode = if req.stream { ResponseMode::Streaming } else { ResponseMode::Aggregate };

    let response = state.relay.submit(prompt, mode).await?;
    let created = Utc::now().timestamp();
    info!(consumer = %response.id(), mode = ?mode, "Chat completion accepted");

    match response {
        ConsumerResponse::Streaming { id, chunks } => {
            let encoder = ChunkEncoder { id, created, model: state.model_name.clone() };
            Ok(stream_response(encoder, chunks))
        }
        ConsumerResponse::Aggregate { id, reply } => {
            // Dropping this future (client hang-up) closes the reply channel;
            // the generation itself keeps running.
            let completion = reply.await.map_err(|_| RelayError::RelayStopped)??;
            Ok(Json(ChatCompletion::new(id, created, state.model_name.clone(), completion)).into_response())
        }
    }
}

async fn producer_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| producer_session(socket, state))
}

async fn producer_session(socket: WebSocket, state: AppState) {
    let binding = match state.relay.bind_producer().await {
        Ok(binding) => binding,
        Err(err) => {
            error!("Cannot accept producer: {}", err);
            return;
        }
    };
    let link = binding.link;
    let mut outbound = binding.outbound;
    let dialect = state.dialect;
    let (mut sender, mut receiver) = socket.split();

    // Forward relay instructions to the producer until the link is replaced
    // or the socket stops accepting writes.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let frame = match dialect.encode(&message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(link = link, "Failed to encode relay message: {}", err);
                    continue;
                }
            };
            if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(WsMessage::Close(None)).await;
    });

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if state.relay.producer_frame(link, text.as_str()).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(link = link, "Producer socket error: {}", err);
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    let _ = state.relay.unbind_producer(link);
    info!(link = link, "Producer session closed");
}
