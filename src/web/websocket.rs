use crate::authority::AuthorityHandle;
use crate::relay::Relay;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walletbridge_types::PageMessage;

/// Application state for web handlers
#[derive(Clone)]
pub struct AppState {
    pub authority: AuthorityHandle,
    /// Per-call bound for relayed page requests
    pub relay_timeout: Duration,
    pub session_token: Arc<String>,
}

impl AppState {
    pub fn session_token(&self) -> Arc<String> {
        self.session_token.clone()
    }
}

/// WebSocket upgrade handler. Each socket gets its own relay session.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("Page connected");
    let (mut sender, mut receiver) = socket.split();

    let (page_tx, page_rx) = mpsc::channel::<PageMessage>(64);
    let (relay_tx, mut relay_rx) = mpsc::channel::<PageMessage>(64);

    let relay = Relay::new(state.authority.clone(), state.relay_timeout);
    let relay_task = tokio::spawn(relay.run(page_rx, relay_tx));

    // Relay output to the page
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = relay_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Page input to the relay
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => match serde_json::from_str::<PageMessage>(&text) {
                    Ok(msg) => {
                        if page_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed page message: {}", e),
                },
                Ok(Message::Ping(_)) => {
                    debug!("Received ping");
                }
                Ok(Message::Close(_)) => {
                    info!("Page closed connection");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either direction to finish
    tokio::select! {
        _ = &mut send_task => {
            debug!("Send task completed");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("Receive task completed");
            send_task.abort();
        }
    }
    relay_task.abort();

    info!("Page disconnected");
}
