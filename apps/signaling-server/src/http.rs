//! HTTP and WebSocket endpoints
//!
//! - `POST /api/create-session`, `POST /api/check-session`: validation plane
//! - `GET /ws`: signaling relay
//! - `GET /health`, `GET /stats`

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use shared_protocol::{
    CheckSessionRequest, CheckSessionResponse, ClientEvent, CreateSessionRequest,
    CreateSessionResponse, ErrorResponse, ServerEvent, SessionCode,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::{RegistryError, Relay};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

/// Build the router with all endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/create-session", post(create_session_handler))
        .route("/api/check-session", post(check_session_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = match &self {
            RegistryError::InvalidFileMeta(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotFound => StatusCode::NOT_FOUND,
            RegistryError::Expired => StatusCode::GONE,
            RegistryError::NotParticipant => StatusCode::FORBIDDEN,
            RegistryError::CodeSpaceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn create_session_handler(
    State(state): State<AppState>,
    Json(file_meta): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, RegistryError> {
    let code = state.relay.registry().create(file_meta.clone())?;
    Ok(Json(CreateSessionResponse { code, file_meta }))
}

/// Stateless check; malformed, unknown and expired codes all answer `ok: false`
async fn check_session_handler(
    State(state): State<AppState>,
    Json(request): Json<CheckSessionRequest>,
) -> Json<CheckSessionResponse> {
    let Ok(code) = SessionCode::parse(&request.code) else {
        return Json(CheckSessionResponse::not_ok());
    };

    let registry = state.relay.registry();
    let (Ok(record), Ok(remaining)) = (registry.get(code), registry.remaining(code)) else {
        return Json(CheckSessionResponse::not_ok());
    };

    Json(CheckSessionResponse {
        ok: true,
        file_meta: Some(record.file_meta),
        expires_in_secs: Some(remaining.as_secs()),
    })
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn stats_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "sessions": state.relay.registry().len(),
        "participants": state.relay.participant_count(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state.relay))
}

/// Pump one WebSocket connection through the relay
async fn handle_websocket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (participant, mut outbox) = relay.connect();

    // Forward relay events to the socket
    let forward_task = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };

            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let event = match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Invalid message from {}: {}", participant, e);
                    relay
                        .send_to(
                            participant,
                            ServerEvent::Error {
                                message: format!("invalid message: {e}"),
                            },
                        )
                        .await;
                    continue;
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame from {}", participant);
                continue;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
        };

        relay.handle(participant, event).await;
    }

    relay.disconnect(participant).await;
    forward_task.abort();
}
