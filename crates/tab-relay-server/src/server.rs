//! Axum-based relay listener.
//!
//! One listener carries both WebSocket populations plus a few plain HTTP
//! routes collaborators poll before connecting.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tab_relay_core::protocol::DEFAULT_CLIENT_ID;

use crate::connection::{handle_client_socket, handle_extension_socket};
use crate::state::RelayState;

/// Start the relay and serve until shutdown.
pub async fn start_relay(state: Arc<RelayState>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = relay_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Relay listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Build the route table.
pub fn relay_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/version", get(version_handler))
        .route("/extension/status", get(extension_status_handler))
        .route("/cdp", get(cdp_handler))
        .route("/cdp/{client_id}", get(cdp_named_handler))
        .route("/extension", get(extension_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}

async fn root_handler() -> impl IntoResponse {
    "tab-relay is running"
}

async fn version_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    axum::Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "product": state.version.product,
        "protocolVersion": state.version.protocol_version,
    }))
}

/// Collaborators poll this to decide whether to wait before connecting.
async fn extension_status_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    axum::Json(json!({ "connected": state.extension.connected().await }))
}

async fn cdp_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    accept_client(ws, headers, query, state, DEFAULT_CLIENT_ID.to_string()).await
}

async fn cdp_named_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    accept_client(ws, headers, query, state, client_id).await
}

async fn accept_client(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: HashMap<String, String>,
    state: Arc<RelayState>,
    client_id: String,
) -> Response {
    if !origin_allowed(headers.get(header::ORIGIN)) {
        warn!(%client_id, "Refusing client upgrade from web-page origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(expected) = state.config.resolve_token() {
        let presented = query.get("token").map(String::as_str);
        if !presented.is_some_and(|token| constant_time_eq(token, &expected)) {
            warn!(%client_id, "Refusing client upgrade with missing or bad token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    // Authoritative check happens at registration; this gives a clean HTTP
    // status instead of an immediately closed socket.
    if state.clients.contains(&client_id).await {
        warn!(%client_id, "Refusing duplicate client id at upgrade");
        return StatusCode::CONFLICT.into_response();
    }

    ws.on_upgrade(move |socket| handle_client_socket(state, socket, client_id))
}

async fn extension_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<RelayState>>,
) -> Response {
    if !origin_allowed(headers.get(header::ORIGIN)) {
        warn!("Refusing extension upgrade from web-page origin");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_extension_socket(state, socket))
}

/// Arbitrary web pages must not reach either endpoint. Non-browser callers
/// send no Origin at all, and the extension's origin uses its own scheme;
/// both pass.
fn origin_allowed(origin: Option<&header::HeaderValue>) -> bool {
    let Some(origin) = origin else { return true };
    let Ok(origin) = origin.to_str() else { return false };
    let origin = origin.to_ascii_lowercase();
    !(origin.starts_with("http://") || origin.starts_with("https://"))
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
