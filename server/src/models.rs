//! # Declarative Entities
//!
//! The control plane's persisted data model: nodes, local forward rules,
//! and the tunnel topology (tunnel → chain hops + forwards). The store
//! owns these; live runtime objects (forwarders, sessions) reference them
//! by id only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Nodes ──────────────────────────────────────────────────────

/// Role capability of a node within a tunnel chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Entry,
    Relay,
    Exit,
}

/// An addressable machine managed by the control plane.
///
/// The agent secret authenticates the node's WebSocket session and keys
/// its frame encryption. It is never serialized outward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: u32,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub roles: Vec<NodeRole>,
    #[serde(skip_serializing, default)]
    pub secret: String,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    #[serde(default)]
    pub agent_ver: String,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default = "default_latency")]
    pub latency_ms: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_agent_port() -> u16 {
    8443
}

fn default_true() -> bool {
    true
}

fn default_latency() -> i64 {
    -1
}

impl Default for Node {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            host: String::new(),
            ssh_port: default_ssh_port(),
            roles: Vec::new(),
            secret: String::new(),
            agent_port: default_agent_port(),
            agent_ver: String::new(),
            is_online: false,
            is_active: true,
            last_check: None,
            latency_ms: default_latency(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

impl Node {
    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    /// Assigns a fresh agent-authentication secret (16 random bytes, hex).
    pub fn generate_secret(&mut self) {
        let bytes: [u8; 16] = rand::random();
        self.secret = hex::encode(bytes);
    }

    /// Bootstrap one-liner shown to operators when installing the agent.
    pub fn install_command(&self, panel_addr: &str) -> String {
        format!(
            "curl -fsSL {panel}/api/v1/node-agent/install.sh -o install.sh && \
             chmod +x install.sh && bash install.sh -a {panel} -s {secret}",
            panel = panel_addr,
            secret = self.secret,
        )
    }
}

// ─── Local Forward Rules ────────────────────────────────────────

/// Transport protocol of a forward rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    #[default]
    Tcp,
    Udp,
}

/// One weighted upstream in a rule's load-balancer target list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbTargetSpec {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub is_backup: bool,
}

impl LbTargetSpec {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A declarative listen→upstream mapping executed by the local forwarder
/// runtime. When `lb_targets` is non-empty the upstream is chosen by the
/// load balancer instead of `target_address:target_port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRule {
    #[serde(default)]
    pub id: u32,
    pub name: String,
    pub listen_port: u16,
    #[serde(default)]
    pub protocol: RuleProtocol,
    #[serde(default)]
    pub target_address: String,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub lb_strategy: String,
    #[serde(default)]
    pub lb_targets: Vec<LbTargetSpec>,
    /// Bytes per second for the client→upstream direction; 0 = unlimited.
    #[serde(default)]
    pub bandwidth_limit: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub traffic_up: i64,
    #[serde(default)]
    pub traffic_down: i64,
    #[serde(default)]
    pub connections: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for ForwardRule {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            listen_port: 0,
            protocol: RuleProtocol::Tcp,
            target_address: String::new(),
            target_port: 0,
            lb_strategy: String::new(),
            lb_targets: Vec::new(),
            bandwidth_limit: 0,
            is_active: true,
            traffic_up: 0,
            traffic_down: 0,
            connections: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

// ─── Tunnels ────────────────────────────────────────────────────

/// Topology class of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    /// Single hop: a listener on the entry node forwards straight to the
    /// remote address.
    PortForward,
    /// Multi hop: entry → zero or more relays → exit, each link speaking
    /// the chain hop's protocol.
    ChainRelay,
}

/// Position of a chain hop within its tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainRole {
    Entry,
    Relay,
    Exit,
}

/// Link protocol spoken on a chain hop. Everything that is not a
/// WebSocket flavour maps onto a plain TCP listener/dialer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkProtocol {
    #[default]
    Relay,
    Tcp,
    Udp,
    Ws,
    Wss,
    Mws,
    Mwss,
}

impl LinkProtocol {
    /// Listener/dialer tag handed to the agent. Symmetric mapping:
    /// the WebSocket flavours keep their tag, everything else is `tcp`.
    pub fn transport_tag(self) -> &'static str {
        match self {
            LinkProtocol::Ws => "ws",
            LinkProtocol::Wss => "wss",
            LinkProtocol::Mws => "mws",
            LinkProtocol::Mwss => "mwss",
            _ => "tcp",
        }
    }
}

/// A declarative multi-node forwarding topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    #[serde(default)]
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    #[serde(default = "default_ratio")]
    pub traffic_ratio: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub flow_in: i64,
    #[serde(default)]
    pub flow_out: i64,
    #[serde(default)]
    pub chain_tunnels: Vec<ChainTunnel>,
    #[serde(default)]
    pub forwards: Vec<Forward>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_ratio() -> f64 {
    1.0
}

/// One hop of a tunnel chain: which node, which port on it, and which
/// link protocol the previous hop dials it with. `sort_index` is dense
/// and unique within a tunnel; deployment order follows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTunnel {
    #[serde(default)]
    pub id: u32,
    pub tunnel_id: u32,
    pub chain_type: ChainRole,
    pub node_id: u32,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: LinkProtocol,
    #[serde(default)]
    pub sort_index: i32,
    /// Eagerly loaded by the store; `None` when the node was deleted.
    #[serde(default)]
    pub node: Option<Node>,
}

/// A tunnel-scoped user mapping: listen port on the entry node to a
/// remote target address. The inbound-proxy fields are opaque metadata
/// consumed by agent-side proxy binaries, not by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forward {
    #[serde(default)]
    pub id: u32,
    pub tunnel_id: u32,
    #[serde(default)]
    pub name: String,
    /// Remote target, `host:port`.
    pub remote_address: String,
    #[serde(default)]
    pub protocol: RuleProtocol,
    pub listen_port: u16,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub flow_in: i64,
    #[serde(default)]
    pub flow_out: i64,
    #[serde(default)]
    pub connections: i64,
    #[serde(default)]
    pub inbound_enabled: bool,
    #[serde(default)]
    pub inbound_type: String,
    #[serde(default)]
    pub inbound_config: String,
}

// ─── Persisted Aggregates ───────────────────────────────────────

/// One row of the rolling traffic history, stamped with a local date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficStat {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub rule_id: u32,
    pub date: String,
    pub traffic_up: i64,
    pub traffic_down: i64,
    pub connections: i64,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub net_in: i64,
    pub net_out: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Default for TrafficStat {
    fn default() -> Self {
        Self {
            id: 0,
            rule_id: 0,
            date: String::new(),
            traffic_up: 0,
            traffic_down: 0,
            connections: 0,
            cpu_percent: 0.0,
            mem_percent: 0.0,
            net_in: 0,
            net_out: 0,
            created_at: Utc::now(),
        }
    }
}

/// Operational event surfaced to operators (node flips, deploy outcomes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLog {
    #[serde(default)]
    pub id: u32,
    pub level: String,
    pub module: String,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}
