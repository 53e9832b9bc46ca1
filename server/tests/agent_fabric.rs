//! Socket-level tests of the agent fabric: a scripted agent speaks the
//! real encrypted WebSocket protocol against a served controller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use fabric_protocol::{AgentCommand, CommandAction};
use fabric_server::error::FabricError;
use fabric_server::hub::crypto::FrameCipher;
use fabric_server::models::{
    ChainRole, ChainTunnel, Forward, LinkProtocol, Node, Tunnel, TunnelType,
};
use fabric_server::state::AppState;
use fabric_server::store::{MemoryStore, Store};

// ─── Harness ────────────────────────────────────────────────────

async fn start_controller() -> (Arc<MemoryStore>, AppState, SocketAddr) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store.clone(), "http://127.0.0.1:7070");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = fabric_server::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (store, state, addr)
}

fn seed_node(store: &MemoryStore, name: &str) -> Node {
    store.insert_node(Node {
        name: name.into(),
        host: "127.0.0.1".into(),
        ..Node::default()
    })
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Scripted agent: connects with a node secret and speaks encrypted
/// frames the way the real agent binary would.
struct ScriptedAgent {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    cipher: FrameCipher,
}

impl ScriptedAgent {
    async fn connect(
        addr: SocketAddr,
        secret: &str,
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let url = format!("ws://{addr}/api/v1/agent/ws?secret={secret}");
        let (ws, _) = connect_async(url).await?;
        Ok(Self {
            ws,
            cipher: FrameCipher::new(secret),
        })
    }

    async fn send_report(&mut self, report: Value) {
        let frame = self.cipher.seal(report.to_string().as_bytes()).unwrap();
        self.ws.send(Message::Text(frame.into())).await.unwrap();
    }

    async fn recv_command(&mut self) -> AgentCommand {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("no command arrived")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(frame) = msg {
                let plaintext = self.cipher.open(frame.as_str()).unwrap();
                return serde_json::from_slice(&plaintext).unwrap();
            }
        }
    }

    async fn respond(&mut self, id: &str, success: bool, message: &str) {
        self.send_report(json!({
            "type": "response",
            "id": id,
            "data": { "success": success, "message": message },
        }))
        .await;
    }
}

// ─── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn unknown_secret_is_rejected_at_upgrade() {
    let (_store, _state, addr) = start_controller().await;
    let result = ScriptedAgent::connect(addr, "0000deadbeef0000").await;
    assert!(result.is_err(), "upgrade should fail with 401");
}

#[tokio::test]
async fn heartbeat_flips_online_and_disconnect_flips_back() {
    let (store, state, addr) = start_controller().await;
    let node = seed_node(&store, "edge-1");
    assert!(!store.node(node.id).unwrap().is_online);

    let mut agent = ScriptedAgent::connect(addr, &node.secret).await.unwrap();
    wait_until(|| state.hub.is_online(node.id)).await;
    assert!(store.node(node.id).unwrap().is_online);

    agent.send_report(json!({ "type": "heartbeat" })).await;
    wait_until(|| store.node(node.id).unwrap().latency_ms == 0).await;

    // Dropping the socket ends the reader, which unregisters.
    drop(agent);
    wait_until(|| !store.node(node.id).unwrap().is_online).await;
    assert!(!state.hub.is_online(node.id));
}

#[tokio::test]
async fn command_response_round_trip_clears_the_pending_table() {
    let (store, state, addr) = start_controller().await;
    let node = seed_node(&store, "edge-2");

    let mut agent = ScriptedAgent::connect(addr, &node.secret).await.unwrap();
    wait_until(|| state.hub.is_online(node.id)).await;

    let hub = state.hub.clone();
    let node_id = node.id;
    let waiter = tokio::spawn(async move {
        hub.send_to_node(node_id, AgentCommand::status(), Duration::from_secs(5))
            .await
    });

    let cmd = agent.recv_command().await;
    assert_eq!(cmd.action, CommandAction::Status);
    agent.respond(&cmd.id, true, "").await;

    let report = waiter.await.unwrap().unwrap();
    assert_eq!(report.id, cmd.id);
    assert_eq!(report.node_id, node.id);
    assert_eq!(state.hub.pending_requests(), 0);
}

#[tokio::test]
async fn stalled_agent_times_out_and_leaves_no_pending_entry() {
    let (store, state, addr) = start_controller().await;
    let node = seed_node(&store, "edge-3");

    let _agent = ScriptedAgent::connect(addr, &node.secret).await.unwrap();
    wait_until(|| state.hub.is_online(node.id)).await;

    let started = Instant::now();
    let err = state
        .hub
        .send_to_node(node.id, AgentCommand::status(), Duration::from_millis(200))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        FabricError::CommandTimeout { node_id, .. } if node_id == node.id
    ));
    assert!(elapsed >= Duration::from_millis(180), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert_eq!(state.hub.pending_requests(), 0);
}

#[tokio::test]
async fn rejected_commands_surface_the_agent_reason() {
    let (store, state, addr) = start_controller().await;
    let node = seed_node(&store, "edge-4");

    let mut agent = ScriptedAgent::connect(addr, &node.secret).await.unwrap();
    wait_until(|| state.hub.is_online(node.id)).await;

    let hub = state.hub.clone();
    let node_id = node.id;
    let waiter = tokio::spawn(async move {
        hub.send_to_node(node_id, AgentCommand::status(), Duration::from_secs(5))
            .await
    });

    let cmd = agent.recv_command().await;
    agent.respond(&cmd.id, false, "port already bound").await;

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, FabricError::AgentRejection(ref reason) if reason == "port already bound"));
    assert_eq!(state.hub.pending_requests(), 0);
}

#[tokio::test]
async fn a_reconnecting_agent_replaces_its_session() {
    let (store, state, addr) = start_controller().await;
    let node = seed_node(&store, "edge-5");

    let _first = ScriptedAgent::connect(addr, &node.secret).await.unwrap();
    wait_until(|| state.hub.is_online(node.id)).await;

    let mut second = ScriptedAgent::connect(addr, &node.secret).await.unwrap();
    // Give the replacement a moment to settle; the node must stay
    // online with exactly one registered session.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.hub.is_online(node.id));
    assert_eq!(state.hub.connected_agents().len(), 1);

    // Commands reach the replacement session.
    let hub = state.hub.clone();
    let node_id = node.id;
    let waiter = tokio::spawn(async move {
        hub.send_to_node(node_id, AgentCommand::status(), Duration::from_secs(5))
            .await
    });
    let cmd = second.recv_command().await;
    second.respond(&cmd.id, true, "").await;
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn port_forward_deploy_reaches_the_entry_agent() {
    let (store, state, addr) = start_controller().await;
    let node = seed_node(&store, "entry-1");

    let tunnel = store.insert_tunnel(Tunnel {
        id: 0,
        name: "pf".into(),
        tunnel_type: TunnelType::PortForward,
        traffic_ratio: 1.0,
        is_active: true,
        flow_in: 0,
        flow_out: 0,
        chain_tunnels: vec![ChainTunnel {
            id: 0,
            tunnel_id: 0,
            chain_type: ChainRole::Entry,
            node_id: node.id,
            port: 0,
            protocol: LinkProtocol::Relay,
            sort_index: 0,
            node: None,
        }],
        forwards: vec![Forward {
            id: 0,
            tunnel_id: 0,
            name: String::new(),
            remote_address: "10.0.0.9:22".into(),
            protocol: Default::default(),
            listen_port: 20000,
            is_active: true,
            flow_in: 0,
            flow_out: 0,
            connections: 0,
            inbound_enabled: false,
            inbound_type: String::new(),
            inbound_config: String::new(),
        }],
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    });

    let mut agent = ScriptedAgent::connect(addr, &node.secret).await.unwrap();
    wait_until(|| state.hub.is_online(node.id)).await;

    let deployer = state.deployer.clone();
    let tunnel_id = tunnel.id;
    let deploy = tokio::spawn(async move { deployer.deploy_tunnel(tunnel_id).await });

    let cmd = agent.recv_command().await;
    assert_eq!(cmd.action, CommandAction::AddService);
    let forward_id = tunnel.forwards[0].id;
    assert_eq!(
        cmd.data["name"],
        format!("fwd_{}_{}", tunnel.id, forward_id)
    );
    assert_eq!(cmd.data["addr"], ":20000");
    agent.respond(&cmd.id, true, "").await;

    let outcome = deploy.await.unwrap().unwrap();
    assert!(outcome.is_success(), "errors: {:?}", outcome.errors);
    assert_eq!(outcome.issued, 1);

    // Undeploy against a disconnected fabric aggregates, never panics.
    drop(agent);
    wait_until(|| !state.hub.is_online(node.id)).await;
    let outcome = state.deployer.undeploy_tunnel(tunnel.id).await.unwrap();
    assert_eq!(outcome.issued, 4);
    assert_eq!(outcome.errors.len(), 4);
}
