//! WebSocket sessions
//!
//! One session per client. A writer task drains the connection's bounded
//! outbound queue into the socket while the reader loop handles inbound
//! subscribe, unsubscribe and update messages. Rejections go back to the
//! sender only, as `error` events. A session whose queue overflows is
//! swept by the registry and closed with code 1013.

use crate::channel::{CloseGuard, ConnectionHandle};
use crate::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use matchcast_common::events::{ClientMessage, LiveEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(socket: WebSocket, state: AppState) {
    let (handle, mut outbound) = ConnectionHandle::channel(state.channel_capacity);
    let conn = handle.id();

    let registry = Arc::clone(&state.registry);
    let _closed = CloseGuard::new(move || {
        registry.on_disconnect(conn);
    });
    info!(connection_id = %conn, "Client connected");

    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(event.as_ref()) {
                Ok(text) => text,
                Err(e) => {
                    warn!(connection_id = %conn, error = %e, "Failed to serialize event");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(connection_id = %conn, error = %e, "Socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    };

    let reader = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => handle_text(&state, &handle, &text).await,
                Ok(Message::Binary(_)) => reject(&handle, "binary frames are not supported".to_string()),
                Ok(Message::Close(_)) => break,
                // Ping/pong answered by the transport
                Ok(_) => {}
                Err(e) => {
                    debug!(connection_id = %conn, error = %e, "Socket read failed");
                    break;
                }
            }
        }
    };

    let stalled = tokio::select! {
        _ = writer => false,
        _ = reader => false,
        _ = handle.closed() => true,
    };

    if stalled {
        warn!(connection_id = %conn, "Outbound queue overflowed, closing session");
        let frame = CloseFrame {
            code: close_code::AGAIN,
            reason: "subscriber too slow".into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
}

async fn handle_text(state: &AppState, handle: &ConnectionHandle, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            reject(handle, format!("malformed message: {}", e));
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { topic } => {
            state.registry.subscribe(&topic, handle);
        }
        ClientMessage::Unsubscribe { topic } => {
            state.registry.unsubscribe(&topic, handle.id());
        }
        ClientMessage::Update { topic, payload } => {
            if let Err(e) = state.ingestor.ingest(&topic, payload).await {
                reject(handle, format!("update for {} rejected: {}", topic, e));
            }
        }
    }
}

fn reject(handle: &ConnectionHandle, message: String) {
    debug!(connection_id = %handle.id(), %message, "Rejecting client message");
    if let Err(e) = handle.send(Arc::new(LiveEvent::Error { message })) {
        debug!(error = %e, "Could not deliver rejection");
    }
}

/// Build WebSocket routes
pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}
