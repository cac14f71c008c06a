//! `/ws`: forwards the control event bus to WebSocket clients as JSON text
//! frames, with ping/pong keepalive.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use pcc_common::ControlEvent;

use super::SharedState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// No pong within this window after a ping means the client is gone.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| run_socket(socket, rx))
}

fn encode(event: &ControlEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "Failed to serialize control event");
            None
        }
    }
}

async fn run_socket(socket: WebSocket, mut rx: broadcast::Receiver<ControlEvent>) {
    let (mut sender, mut receiver) = socket.split();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("WebSocket client missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let Some(text) = encode(&event) else { continue };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "WebSocket client lagged behind the event bus");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
