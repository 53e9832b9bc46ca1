//! Server entry point.
//!
//! Initializes logging, wires the shared state, restores active forward
//! rules, starts the background loops, and serves the agent-facing HTTP
//! surface.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use fabric_server::state::AppState;
use fabric_server::store::MemoryStore;

#[tokio::main]
async fn main() {
    // Structured logging with env-filter support. Default log level is
    // `info` for this crate; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fabric_server=info".into()),
        )
        .init();

    let listen: SocketAddr = std::env::var("FABRIC_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:7070".into())
        .parse()
        .expect("FABRIC_LISTEN must be host:port");
    let panel_addr =
        std::env::var("FABRIC_PANEL_ADDR").unwrap_or_else(|_| format!("http://{listen}"));

    // The relational store is wired in by the admin layer; standalone
    // the controller runs on the in-memory implementation.
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store, panel_addr);

    // Restore every active rule, then start the periodic loops.
    state.manager.start_all().await;
    let shutdown = CancellationToken::new();
    state.spawn_background(&shutdown);

    let app = fabric_server::router(state).layer(CorsLayer::permissive());

    info!("fabric controller listening on {listen}");
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .expect("bind controller listener");
    axum::serve(listener, app).await.expect("serve");
}
