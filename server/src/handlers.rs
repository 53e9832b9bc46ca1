//! # Agent WebSocket Handlers
//!
//! Connection lifecycle for node agents:
//! - Authenticating the upgrade request by agent secret
//! - Registering the encrypted session with the hub
//! - Driving the reader loop until the socket errors or closes
//! - Unregistering on the way out
//!
//! Writes go through the session held by the hub; this module only ever
//! owns the read half.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::hub::{AgentHub, AgentSession};
use crate::models::Node;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct AgentAuth {
    #[serde(default)]
    secret: String,
}

/// `GET /api/v1/agent/ws?secret=...` — upgrades an agent connection.
///
/// The secret authenticates the node: an unknown secret is rejected with
/// 401 before the upgrade happens.
pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<AgentAuth>,
    State(state): State<AppState>,
) -> Response {
    let Some(node) = state.store.node_by_secret(&auth.secret) else {
        warn!("agent upgrade rejected: unknown secret");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state.hub.clone(), node))
}

/// Runs one agent connection to completion.
///
/// ## Flow
/// 1. Split the socket; the write half becomes the hub-owned session
/// 2. Register with the hub (replacing any stale session for the node)
/// 3. Read frames until the socket errors or closes
/// 4. Unregister, which flips the node offline
async fn handle_agent_socket(socket: WebSocket, hub: Arc<AgentHub>, node: Node) {
    // Connection id for log correlation; a node that reconnects gets a
    // fresh one while keeping its node id.
    let conn_id = Uuid::new_v4();
    info!(node = node.id, name = %node.name, %conn_id, "agent connected");

    let (sink, mut stream) = socket.split();
    let session = Arc::new(AgentSession::new(&node, sink));
    hub.register(session.clone()).await;

    // ── Reader Loop ──
    // Only encrypted text frames carry protocol messages; pings and
    // binary frames are ignored. The first socket error ends the loop.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(frame) => hub.handle_frame(&session, frame.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(node = node.id, %conn_id, "agent disconnected");
    hub.unregister(&session).await;
}
