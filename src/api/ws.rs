// =============================================================================
// WebSocket endpoint -- the concrete subscriber transport for the hub
// =============================================================================
//
// Clients connect to `/api/v1/ws?channel=<name>` and become subscribers of
// that broadcast channel. The socket task drains the subscriber's transport
// receiver and forwards payloads as JSON text frames; when the hub prunes
// the subscriber its receiver closes and the socket shuts down.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Broadcast channel to subscribe to (e.g. `market_data`,
    /// `market_data:AAPL`, `portfolio`, `trading_signals`).
    channel: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let channel = query.channel.unwrap_or_else(|| "market_data".to_string());
    info!(channel = %channel, "WebSocket connection accepted -- upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, channel))
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, channel: String) {
    let (handle, mut payload_rx) = state.hub.connect(&channel, json!({ "transport": "ws" }));
    let (mut sender, mut receiver) = socket.split();

    // Confirm the subscription before any broadcast payload.
    let hello = json!({
        "type": "subscribed",
        "channel": channel,
        "subscriber_id": handle.id,
    });
    if sender
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        state.hub.disconnect(&handle);
        return;
    }

    loop {
        tokio::select! {
            // Hub -> socket. A closed receiver means the hub pruned us.
            payload = payload_rx.recv() => {
                match payload {
                    Some(payload) => {
                        if let Err(e) = sender.send(Message::Text(payload.to_string().into())).await {
                            debug!(error = %e, "WebSocket send failed -- disconnecting");
                            break;
                        }
                    }
                    None => {
                        info!(subscriber_id = handle.id, "hub closed transport -- disconnecting");
                        break;
                    }
                }
            }

            // Socket -> hub. Only liveness traffic is expected.
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(subscriber_id = handle.id, "WebSocket closed by client");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat any text frame as a client heartbeat.
                        debug!(msg = %text, "WebSocket text message received");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error -- disconnecting");
                        break;
                    }
                }
            }
        }
    }

    state.hub.disconnect(&handle);
}
