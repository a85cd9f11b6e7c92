//! Producer Socket Suite
//!
//! Serves the producer router on an ephemeral port and plays the userscript
//! over a real WebSocket connection.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chat_relay::relay::{ResponseMode, WireDialect};
use chat_relay::server::{producer_router, AppState};
use chat_relay::{RelayConfig, RelayCore, RelayError, RelayHandle};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn serve(dialect: WireDialect) -> (RelayHandle, SocketAddr) {
    let config = RelayConfig { dialect, ..RelayConfig::default() };
    let relay = RelayCore::spawn(&config);
    let app = producer_router(AppState::new(relay.clone(), &config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (relay, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    client
}

async fn wait_until_ready(relay: &RelayHandle) {
    timeout(WAIT, async {
        while !relay.status().await.unwrap().producer_ready {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("producer never became ready");
}

/// Next text frame from the relay, parsed as JSON.
async fn next_event(client: &mut Client) -> Value {
    loop {
        let message = timeout(WAIT, client.next()).await.expect("no frame from relay");
        match message {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string().into())).await.unwrap();
}

#[tokio::test]
async fn test_legacy_dialect_and_close_releases_partial_text() {
    let (relay, addr) = serve(WireDialect::Legacy).await;
    let mut client = connect(addr).await;
    send_json(&mut client, json!({ "type": "connected", "message": "userscript connected" })).await;
    wait_until_ready(&relay).await;

    let reply = match relay.submit("hello there", ResponseMode::Aggregate).await.unwrap() {
        chat_relay::relay::ConsumerResponse::Aggregate { reply, .. } => reply,
        other => panic!("expected aggregate response, got {:?}", other),
    };

    let start = next_event(&mut client).await;
    assert_eq!(start["event"], "send-user-message");
    assert_eq!(start["message"], "hello there");

    send_json(&mut client, json!({ "event": "stream-message", "message": "partial answ" })).await;
    client.close(None).await.unwrap();

    let outcome = timeout(WAIT, reply).await.expect("no reply after close").unwrap();
    assert_eq!(outcome, Err(RelayError::ProducerDisconnected { partial: "partial answ".into() }));
    assert!(!relay.status().await.unwrap().producer_ready);
}

#[tokio::test]
async fn test_new_connection_closes_replaced_session() {
    let (relay, addr) = serve(WireDialect::Canonical).await;
    let mut first = connect(addr).await;
    wait_until_ready(&relay).await;

    let mut second = connect(addr).await;

    // The replaced session is closed from the relay side.
    let closed = timeout(WAIT, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "old session was not closed");
    assert!(relay.status().await.unwrap().producer_ready);

    let _pending = relay.submit("to the new link", ResponseMode::Streaming).await.unwrap();
    let start = next_event(&mut second).await;
    assert_eq!(start["event"], "start-generation");
    assert_eq!(start["message"], "to the new link");
    assert!(start["generation"].is_string());
}
