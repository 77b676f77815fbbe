//! HTTP API
//!
//! | Method | Path           | Answer                                   |
//! |--------|----------------|------------------------------------------|
//! | GET    | `/`, `/health` | service and transport health             |
//! | GET    | `/api/data`    | current snapshot                         |
//! | GET    | `/api/status`  | current snapshot                         |
//! | POST   | `/api/control` | `{device, action}` -> `{status, message}` |
//! | POST   | `/api/data`    | legacy device push, acknowledged only    |
//! | GET    | `/api/commands`| legacy command poll, always `{}`         |
//!
//! Every `/api/control` answer, including a body that fails to parse, has the
//! `{status, message}` shape.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::{AppState, SERVICE_NAME};
use crate::command::CommandError;
use crate::mqtt::Transport;
use crate::state::Snapshot;

pub fn router<T: Transport>(state: Arc<AppState<T>>) -> Router {
    Router::new()
        .route("/", get(health::<T>))
        .route("/health", get(health::<T>))
        .route("/api/data", get(snapshot::<T>).post(legacy_data))
        .route("/api/status", get(snapshot::<T>))
        .route("/api/control", post(control::<T>))
        .route("/api/commands", get(legacy_commands))
        .with_state(state)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub mqtt: &'static str,
    pub online: bool,
    /// Seconds since start
    pub uptime: f64,
    pub sessions: usize,
    pub revision: u64,
    pub messages_received: usize,
    pub messages_sent: usize,
}

pub async fn health<T: Transport>(State(state): State<Arc<AppState<T>>>) -> Json<HealthReport> {
    let transport = state.commands.transport().status();
    let snapshot = state.store.current();
    Json(HealthReport {
        status: "running",
        service: SERVICE_NAME,
        mqtt: transport.connection_state.as_str(),
        online: snapshot.online,
        uptime: state.started_at.elapsed().as_secs_f64(),
        sessions: state.hub.len(),
        revision: snapshot.revision,
        messages_received: transport.messages_received,
        messages_sent: transport.messages_sent,
    })
}

pub async fn snapshot<T: Transport>(State(state): State<Arc<AppState<T>>>) -> Json<Snapshot> {
    Json(Snapshot::clone(&state.store.current()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    /// Must be a string; anything else is answered as an invalid device
    #[serde(default)]
    pub device: Value,
    /// Strings pass through; booleans and numbers are sent as their text form
    #[serde(default)]
    pub action: Value,
}

impl ControlRequest {
    fn device_name(&self) -> Option<&str> {
        self.device.as_str()
    }

    fn action_text(&self) -> String {
        match &self.action {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponse {
    pub status: &'static str,
    pub message: String,
}

impl ControlResponse {
    fn success(message: String) -> Self {
        Self {
            status: "success",
            message,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error",
            message,
        }
    }
}

pub async fn control<T: Transport>(
    State(state): State<Arc<AppState<T>>>,
    body: Result<Json<ControlRequest>, JsonRejection>,
) -> (StatusCode, Json<ControlResponse>) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "Rejected control request");
            return (
                StatusCode::BAD_REQUEST,
                Json(ControlResponse::error(format!(
                    "Invalid request: {}",
                    rejection.body_text()
                ))),
            );
        }
    };
    let Some(device) = request.device_name() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ControlResponse::error("Invalid device".to_string())),
        );
    };
    let action = request.action_text();
    match state.commands.submit(device, &action).await {
        Ok(ack) => (
            StatusCode::OK,
            Json(ControlResponse::success(format!(
                "Command sent: {} {}",
                ack.device, ack.command.action
            ))),
        ),
        Err(e) => {
            let status = match &e {
                CommandError::UnknownDevice(_) | CommandError::InvalidAction => {
                    StatusCode::BAD_REQUEST
                }
                CommandError::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                CommandError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ControlResponse::error(e.to_string())))
        }
    }
}

pub async fn legacy_data() -> Json<ControlResponse> {
    Json(ControlResponse::success(
        "Data received (legacy endpoint)".to_string(),
    ))
}

pub async fn legacy_commands() -> Json<Map<String, Value>> {
    Json(Map::new())
}
