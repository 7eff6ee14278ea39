//! WebSocket stream of newly indexed transaction hashes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, instrument, warn};

use crate::api::models::StreamMessage;
use crate::app_state::AppState;

/// Upgrade to a websocket that receives one message per new transaction.
#[instrument(skip(state, ws))]
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    info!("WebSocket connection requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send(socket: &mut WebSocket, message: &StreamMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize stream message");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Subscribe before greeting so nothing promoted in between is missed.
    let mut rx = state.monitor.subscribe();
    info!("WebSocket connection established");

    if !send(&mut socket, &StreamMessage::connected()).await {
        return;
    }

    loop {
        tokio::select! {
            received = rx.recv() => {
                let message = match received {
                    Ok(hash) => StreamMessage::new_transaction(format!("{hash:#x}")),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Stream client lagging");
                        StreamMessage::lagged(skipped)
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send(&mut socket, &message).await {
                    warn!("Failed to send message, closing connection");
                    break;
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed connection");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket connection closed");
}
