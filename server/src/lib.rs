//! # Fabric Controller
//!
//! Control plane of a multi-node traffic-forwarding fabric. A central
//! controller manages remote agents on entry, relay, and exit machines;
//! declared tunnels and forwards are compiled into per-node service and
//! chain descriptors, pushed over encrypted WebSocket sessions, and live
//! traffic and health telemetry stream back.
//!
//! ## Modules
//!
//! - [`hub`]       - encrypted agent sessions, registry, command correlation
//! - [`deploy`]    - tunnel topology → per-node command plans
//! - [`forwarder`] - local TCP/UDP forwarding engine with rate limiting
//! - [`manager`]   - lifecycle of local forwarders per rule
//! - [`collector`] - telemetry sampling, rolling history, persistence
//! - [`checker`]   - periodic node reachability probes
//! - [`handlers`]  - agent WebSocket lifecycle
//! - [`api`]       - agent-facing REST endpoints
//! - [`store`]     - persistence seam consumed by all of the above

pub mod api;
pub mod checker;
pub mod collector;
pub mod deploy;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod hub;
pub mod manager;
pub mod models;
pub mod state;
pub mod store;
pub mod syslog;

use axum::{routing::get, Router};

use crate::state::AppState;

/// Builds the Axum router with the agent WebSocket and REST endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/agent/ws", get(handlers::agent_ws_handler))
        .route("/api/v1/agents", get(api::list_agents))
        .route("/api/v1/node-agent/install.sh", get(api::install_script))
        .with_state(state)
}
