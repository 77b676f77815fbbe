//! # Observer-facing Servers
//!
//! Two listeners on the same bind address:
//!
//! ```text
//! :port     HTTP API    health, snapshot polling, command submission
//! :ws_port  WebSocket   one observer session per connection (init + updates)
//! ```
//!
//! Both shut down when the shared cancellation token fires; open websocket sessions
//! are closed through the hub at that point.

pub mod http;
pub mod ws;

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::command::CommandRouter;
use crate::hub::FanoutHub;
use crate::mqtt::Transport;
use crate::state::StateStore;

pub const SERVICE_NAME: &str = "IoT MQTT Bridge Server";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Everything the HTTP handlers read. Shared as `Arc<AppState<T>>`.
pub struct AppState<T> {
    pub store: Arc<StateStore>,
    pub hub: Arc<FanoutHub>,
    pub commands: CommandRouter<T>,
    pub started_at: Instant,
}

impl<T: Transport> AppState<T> {
    pub fn new(store: Arc<StateStore>, hub: Arc<FanoutHub>, commands: CommandRouter<T>) -> Self {
        Self {
            store,
            hub,
            commands,
            started_at: Instant::now(),
        }
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Serves the HTTP API until `cancel` fires.
pub async fn serve_http<T: Transport>(
    listener: TcpListener,
    state: Arc<AppState<T>>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let app = http::router(state).layer(CorsLayer::permissive());
    info!(addr = ?listener.local_addr().ok(), "HTTP API listening");
    let stop = cancel.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await;
    finish("HTTP API", result, &cancel)
}

/// Serves websocket observers until `cancel` fires, then closes every session.
pub async fn serve_ws(
    listener: TcpListener,
    hub: Arc<FanoutHub>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let app: Router = ws::router(hub.clone());
    info!(addr = ?listener.local_addr().ok(), "WebSocket server listening");
    let stop = cancel.clone();
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        stop.cancelled().await;
        hub.close_all();
    })
    .await;
    finish("WebSocket server", result, &cancel)
}

/// A listener that fails takes the rest of the process down with it.
fn finish(name: &str, result: std::io::Result<()>, cancel: &CancellationToken) -> Result<(), ServerError> {
    match result {
        Ok(()) => {
            info!(server = name, "Stopped");
            Ok(())
        }
        Err(e) => {
            error!(server = name, error = %e, "Server failed");
            cancel.cancel();
            Err(ServerError::Serve(e))
        }
    }
}
