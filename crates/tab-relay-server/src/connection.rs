//! WebSocket connection lifecycle — read/write loops for both populations.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tab_relay_core::protocol::{ClientCommand, ExtensionFrame, ForwardedEvent};

use crate::clients::Outbound;
use crate::events::handle_forwarded_event;
use crate::extension::PING_INTERVAL;
use crate::router::handle_command;
use crate::state::RelayState;

/// Drain queued outbound messages into the socket until it closes or a
/// close is requested.
async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Text(text) => {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close(reason) => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Handle one automation client connection.
pub async fn handle_client_socket(state: Arc<RelayState>, ws: WebSocket, client_id: String) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();

    // The upgrade handler pre-checks, but registration is what's
    // authoritative under concurrent connects.
    if state.clients.register(&client_id, tx.clone()).await.is_err() {
        warn!(%client_id, "Rejecting duplicate client id");
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "client id already connected".into(),
            })))
            .await;
        return;
    }
    info!(%client_id, "Client connected");

    let writer = tokio::spawn(write_loop(ws_tx, rx));

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let Ok(cmd) = serde_json::from_str::<ClientCommand>(&text) else {
                    // No id to address a reply to; nothing to send back.
                    debug!(%client_id, "Dropping malformed client frame");
                    continue;
                };
                let (reply, synthesized) = handle_command(&state, cmd).await;
                // The reply goes on the queue before any synthesized event,
                // so the client learns of a session via the result first.
                match serde_json::to_string(&reply) {
                    Ok(text) => {
                        let _ = tx.send(Outbound::Text(text));
                    }
                    Err(e) => error!(%e, "Failed to serialize reply"),
                }
                for event in synthesized {
                    match serde_json::to_string(&event) {
                        Ok(text) => {
                            let _ = tx.send(Outbound::Text(text));
                        }
                        Err(e) => error!(%e, "Failed to serialize event"),
                    }
                }
            }
            Ok(Message::Close(_)) => {
                debug!(%client_id, "Client requested close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%client_id, %e, "Client socket error");
                break;
            }
        }
    }

    state.clients.unregister(&client_id).await;
    writer.abort();
    info!(%client_id, "Client disconnected");
}

/// Handle the extension connection.
pub async fn handle_extension_socket(state: Arc<RelayState>, ws: WebSocket) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();

    let generation = state.extension_opened(tx.clone()).await;
    info!(generation, "Extension connected");

    let writer = tokio::spawn(write_loop(ws_tx, rx));

    // Liveness probe; stops when the connection's channel is gone.
    let probe = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if tx.send(Outbound::Text(r#"{"method":"ping"}"#.into())).is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_extension_frame(&state, &text).await,
            Ok(Message::Close(_)) => {
                debug!("Extension requested close");
                break;
            }
            Ok(Message::Binary(_)) => {
                warn!("Binary frame on extension socket, closing");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%e, "Extension socket error");
                break;
            }
        }
    }

    probe.abort();
    if state.extension_closed(generation).await {
        info!(generation, "Extension disconnected");
    }
    writer.abort();
}

async fn handle_extension_frame(state: &Arc<RelayState>, text: &str) {
    match serde_json::from_str::<ExtensionFrame>(text) {
        Ok(ExtensionFrame::Reply(reply)) => state.extension.resolve_reply(reply).await,
        Ok(ExtensionFrame::Notification(notification)) => {
            match notification.method.as_str() {
                "pong" => {}
                "log" => forward_extension_log(notification.params),
                "forwardCDPEvent" => {
                    let params = notification.params.unwrap_or(Value::Null);
                    match serde_json::from_value::<ForwardedEvent>(params) {
                        Ok(event) => handle_forwarded_event(state, event).await,
                        Err(e) => debug!(%e, "Dropping malformed forwarded event"),
                    }
                }
                other => debug!(method = %other, "Unrecognized extension frame, dropping"),
            }
        }
        Err(e) => warn!(%e, "Undecodable extension frame dropped"),
    }
}

/// Structured log passthrough from the extension.
fn forward_extension_log(params: Option<Value>) {
    let params = params.unwrap_or(Value::Null);
    let level = params.get("level").and_then(Value::as_str).unwrap_or("info");
    let args = params.get("args").cloned().unwrap_or(Value::Null);
    match level {
        "error" => error!(target: "extension", %args),
        "warn" | "warning" => warn!(target: "extension", %args),
        "debug" => debug!(target: "extension", %args),
        _ => info!(target: "extension", %args),
    }
}
