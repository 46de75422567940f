//! WebSocket signaling endpoint
//!
//! Frames are JSON text. The socket is split: this task reads and handles
//! requests one at a time, a writer task drains both the response queue and
//! the peer's event queue.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use stagecast_sfu::PeerEvent;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::http::AppState;
use crate::impls::SignalingSession;
use crate::protocol::ServerMessage;

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session, events) = SignalingSession::open(state.coordinator.clone());
    let peer_id = session.peer_id().clone();
    info!(peer_id = %peer_id, "WebSocket connection established");

    let (responses_tx, responses_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (ws_sink, mut ws_stream) = socket.split();
    let writer = tokio::spawn(write_loop(ws_sink, responses_rx, events));

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(reply) = session.handle_text(text.as_str()).await {
                    if responses_tx.send(reply).is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                warn!(peer_id = %peer_id, "Ignoring binary frame");
            }
            // ping/pong are answered by axum
            Ok(_) => {}
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // detaching the peer closes its event queue, which ends the writer
    session.close();
    drop(responses_tx);
    if let Err(e) = writer.await {
        error!(peer_id = %peer_id, error = %e, "WebSocket writer task failed");
    }

    info!(peer_id = %peer_id, "WebSocket connection closed");
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut responses: mpsc::UnboundedReceiver<ServerMessage>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    loop {
        let message = tokio::select! {
            Some(response) = responses.recv() => response,
            Some(event) = events.recv() => ServerMessage::Event(event),
            else => break,
        };

        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to encode signaling frame");
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!(error = %e, "Failed to send WebSocket message");
            break;
        }
    }

    let _ = sink.close().await;
}
