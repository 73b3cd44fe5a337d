//! End-to-end tests of the terminal websocket against the in-memory backend.

use futures_util::{SinkExt, StreamExt};
use sandbox_bridge::testing::FakeBackend;
use sandbox_bridge::{http_server, AppState, BridgeConfig, SandboxManager};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const IMAGE: &str = "parrotsec/security:latest";

async fn start_server(fake: Arc<FakeBackend>) -> (SocketAddr, AppState) {
    let config = BridgeConfig {
        readiness_timeout: Duration::from_millis(20),
        readiness_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let state = AppState::new(SandboxManager::new(fake, config));
    let app = http_server::router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/terminal")).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn next_event(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn terminal_session_over_websocket() {
    let fake = Arc::new(FakeBackend::new().with_local_image(IMAGE));
    let (addr, state) = start_server(fake.clone()).await;
    let spawned = state.manager.spawn("xss-1", None).await.unwrap();

    let mut socket = connect(addr).await;
    send(
        &mut socket,
        json!({ "event": "attach-terminal", "data": { "id": spawned.id } }),
    )
    .await;

    let mut exec = fake.next_exec().await.unwrap();
    assert_eq!(exec.container_id, spawned.id);

    exec.write_output("root@parrot:~# ");
    assert_eq!(
        next_event(&mut socket).await,
        json!({ "event": "terminal-output", "data": "root@parrot:~# " })
    );

    send(&mut socket, json!({ "event": "terminal-input", "data": "id\n" })).await;
    assert_eq!(exec.read_input().await, b"id\n");

    socket.send(Message::Binary(b"pwd\n".to_vec())).await.unwrap();
    assert_eq!(exec.read_input().await, b"pwd\n");

    exec.finish();
    assert_eq!(
        next_event(&mut socket).await,
        json!({ "event": "terminal-disconnected" })
    );
}

#[tokio::test]
async fn attach_to_unknown_sandbox_reports_error_and_keeps_socket() {
    let fake = Arc::new(FakeBackend::new().with_local_image(IMAGE));
    let (addr, state) = start_server(fake.clone()).await;

    let mut socket = connect(addr).await;
    send(
        &mut socket,
        json!({ "event": "attach-terminal", "data": { "containerId": "missing" } }),
    )
    .await;
    assert_eq!(
        next_event(&mut socket).await,
        json!({ "event": "error", "data": "Container not found" })
    );
    assert!(fake.calls().is_empty());

    // Same connection can still attach to a real sandbox.
    let spawned = state.manager.spawn("xss-1", None).await.unwrap();
    send(
        &mut socket,
        json!({ "event": "attach-terminal", "data": { "id": spawned.id } }),
    )
    .await;
    let exec = fake.next_exec().await.unwrap();
    exec.write_output("ok");
    assert_eq!(
        next_event(&mut socket).await,
        json!({ "event": "terminal-output", "data": "ok" })
    );
}

#[tokio::test]
async fn malformed_frames_get_an_error_event() {
    let fake = Arc::new(FakeBackend::new());
    let (addr, _) = start_server(fake).await;

    let mut socket = connect(addr).await;
    socket
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();

    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "error");
    assert!(event["data"].as_str().unwrap().starts_with("Invalid message"));
}

#[tokio::test]
async fn closing_the_socket_releases_the_shell() {
    let fake = Arc::new(FakeBackend::new().with_local_image(IMAGE));
    let (addr, state) = start_server(fake.clone()).await;
    let spawned = state.manager.spawn("xss-1", None).await.unwrap();

    let mut socket = connect(addr).await;
    send(
        &mut socket,
        json!({ "event": "attach-terminal", "data": { "id": spawned.id } }),
    )
    .await;
    let mut exec = fake.next_exec().await.unwrap();

    socket.close(None).await.unwrap();

    assert!(exec.input_closed().await);
    // The sandbox itself stays registered.
    assert!(state.manager.registry().contains(&spawned.id).await);
}
