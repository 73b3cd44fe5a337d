//! HTTP server implementation using Axum.

use crate::error::SandboxError;
use crate::state::{AppState, SessionSummary};
use crate::terminal::{ClientEvent, ServerEvent, TerminalBridge};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnRequest {
    #[serde(default)]
    challenge_id: String,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpawnResponse {
    success: bool,
    id: String,
    ip_address: Option<String>,
    desktop_port: Option<u16>,
    shell_port: Option<u16>,
    desktop_url: Option<String>,
    ready: bool,
    message: &'static str,
}

#[derive(Deserialize)]
struct SandboxIdRequest {
    #[serde(default, alias = "containerId")]
    id: Option<String>,
}

#[derive(Deserialize)]
struct OpenUrlRequest {
    #[serde(default, alias = "containerId")]
    id: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    message: &'static str,
}

#[derive(Serialize)]
struct OpenUrlResponse {
    success: bool,
}

#[derive(Serialize)]
struct ListResponse {
    success: bool,
    sandboxes: Vec<SessionSummary>,
    count: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

/// Build the router with every endpoint and the terminal socket.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/sandboxes", get(list_sandboxes))
        .route("/sandboxes/spawn", post(spawn_sandbox))
        .route("/sandboxes/terminate", post(terminate_sandbox))
        .route("/sandboxes/reset", post(reset_sandbox))
        .route("/sandboxes/open-url", post(open_url))
        .route("/terminal", get(terminal_socket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on `addr` until Ctrl-C.
pub async fn run_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let _reaper = state.manager.spawn_reaper();
    let app = router(state);

    info!("Starting HTTP server on {}", addr);
    info!("Terminal socket at ws://{}/terminal", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, running sandboxes are left in place");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "Sandbox bridge is running",
    })
}

async fn spawn_sandbox(
    State(state): State<AppState>,
    payload: Result<Json<SpawnRequest>, JsonRejection>,
) -> Result<Json<SpawnResponse>, SandboxError> {
    let Json(req) = payload.inspect_err(|e| warn!("Rejected request body: {}", e))?;
    if req.challenge_id.trim().is_empty() {
        return Err(SandboxError::InvalidRequest(
            "challengeId is required".to_string(),
        ));
    }
    info!("POST /sandboxes/spawn - challenge: {}", req.challenge_id);

    let spawned = state
        .manager
        .spawn(&req.challenge_id, req.image.as_deref())
        .await
        .inspect_err(|e| error!("Error spawning sandbox: {}", e))?;

    Ok(Json(SpawnResponse {
        success: true,
        id: spawned.id,
        ip_address: spawned.ip_address,
        desktop_port: spawned.endpoints.desktop,
        shell_port: spawned.endpoints.shell,
        desktop_url: spawned.desktop_url,
        ready: spawned.ready,
        message: "Sandbox spawned successfully",
    }))
}

async fn terminate_sandbox(
    State(state): State<AppState>,
    payload: Result<Json<SandboxIdRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, SandboxError> {
    let Json(req) = payload.inspect_err(|e| warn!("Rejected request body: {}", e))?;
    let id = req.id.unwrap_or_default();
    state
        .manager
        .terminate(&id)
        .await
        .inspect_err(|e| error!("Error terminating sandbox {}: {}", id, e))?;

    Ok(Json(ActionResponse {
        success: true,
        message: "Sandbox terminated successfully",
    }))
}

async fn reset_sandbox(
    State(state): State<AppState>,
    payload: Result<Json<SandboxIdRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, SandboxError> {
    let Json(req) = payload.inspect_err(|e| warn!("Rejected request body: {}", e))?;
    let id = req.id.unwrap_or_default();
    state
        .manager
        .reset(&id)
        .await
        .inspect_err(|e| error!("Error resetting sandbox {}: {}", id, e))?;

    Ok(Json(ActionResponse {
        success: true,
        message: "Sandbox reset successfully",
    }))
}

async fn open_url(
    State(state): State<AppState>,
    payload: Result<Json<OpenUrlRequest>, JsonRejection>,
) -> Result<Json<OpenUrlResponse>, SandboxError> {
    let Json(req) = payload.inspect_err(|e| warn!("Rejected request body: {}", e))?;
    let (Some(id), Some(url)) = (
        req.id.filter(|s| !s.is_empty()),
        req.url.filter(|s| !s.is_empty()),
    ) else {
        return Err(SandboxError::InvalidRequest(
            "containerId and url are required".to_string(),
        ));
    };

    state
        .manager
        .open_url(&id, &url)
        .await
        .inspect_err(|e| error!("Error opening URL in sandbox {}: {}", id, e))?;

    Ok(Json(OpenUrlResponse { success: true }))
}

async fn list_sandboxes(State(state): State<AppState>) -> Json<ListResponse> {
    let sandboxes = state.manager.list().await;
    Json(ListResponse {
        success: true,
        count: sandboxes.len(),
        sandboxes,
    })
}

async fn terminal_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| relay_terminal(socket, state))
}

/// Glue between one websocket and its [`TerminalBridge`]: a reader task turns
/// frames into client events, a writer task serializes server events.
async fn relay_terminal(socket: WebSocket, state: AppState) {
    let (mut sink, mut frames) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientEvent>(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(256);

    let bridge = TerminalBridge::new(
        state.manager.registry().clone(),
        state.manager.config().shell_command.clone(),
        outbound_tx.clone(),
    );
    let connection_id = bridge.connection_id().to_string();

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode terminal event: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            let event = match frame {
                Ok(Message::Text(text)) => match ClientEvent::from_json(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = outbound_tx
                            .send(ServerEvent::Error(format!("Invalid message: {e}")))
                            .await;
                        continue;
                    }
                },
                Ok(Message::Binary(data)) => ClientEvent::TerminalInput(data),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if inbound_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    bridge.run(inbound_rx).await;
    let _ = reader.await;
    let _ = writer.await;
    info!(connection_id = %connection_id, "Terminal socket closed");
}
