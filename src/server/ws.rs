//! WebSocket observer sessions.
//!
//! Each connection becomes one hub session. A writer task drains the session's
//! outbox into the socket while the connection task reads (and ignores) whatever the
//! client sends, watching for close. Whichever side ends first ends the session.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::hub::{FanoutHub, ObserverSession};

pub fn router(hub: Arc<FanoutHub>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<FanoutHub>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub, peer))
}

async fn handle_socket(socket: WebSocket, hub: Arc<FanoutHub>, peer: SocketAddr) {
    let session = ObserverSession::accept(Some(peer.to_string()));
    let mut frames = match hub.register(session) {
        Ok(frames) => frames,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Could not open observer session");
            return;
        }
    };
    let id = frames.id();
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = sink.send(Message::Text(frame)).await {
                debug!(session = %id, error = %e, "Observer write failed");
                return;
            }
        }
        // Hub dropped the session: evicted or shutting down.
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(text))) => {
                    debug!(session = %id, length = text.len(), "Ignoring observer message");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %id, error = %e, "Observer read failed");
                    break;
                }
            },
        }
    }

    writer.abort();
    hub.unregister(id);
    info!(session = %id, peer = %peer, "Observer disconnected");
}
