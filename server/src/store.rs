//! # Store Seam
//!
//! The [`Store`] trait is the only surface through which the core touches
//! persisted state. It is deliberately narrow: the admin CRUD layer owns
//! the full relational schema; the core reads declarative entities and
//! writes back liveness, traffic counters, and append-only aggregates.
//!
//! [`MemoryStore`] is the in-process implementation used by the binary
//! and the test suite. Every component receives the store as a
//! constructed `Arc<dyn Store>` dependency; nothing is process-global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use chrono::Utc;

use crate::models::{ForwardRule, Node, SystemLog, TrafficStat, Tunnel};

/// Persisted-state operations the core depends on.
pub trait Store: Send + Sync {
    fn node(&self, id: u32) -> Option<Node>;

    /// Looks a node up by its agent secret. Used to authenticate the
    /// WebSocket upgrade; `None` means 401.
    fn node_by_secret(&self, secret: &str) -> Option<Node>;

    fn active_nodes(&self) -> Vec<Node>;

    /// Count of nodes with `is_active` and a non-negative probe latency.
    fn online_node_count(&self) -> usize;

    /// Flips agent-session liveness and stamps `last_check`.
    fn mark_node_session(&self, id: u32, online: bool);

    /// Heartbeat ingress: online, checked now, latency zero.
    fn record_heartbeat(&self, id: u32);

    /// Probe result write-back; latency is −1 when unreachable.
    fn record_node_probe(&self, id: u32, latency_ms: i64);

    fn active_rules(&self) -> Vec<ForwardRule>;

    /// Writes live forwarder counters back onto the rule row.
    fn update_rule_traffic(&self, id: u32, up: u64, down: u64, connections: i64);

    /// Fetches a tunnel with its chain hops (nodes attached) and forwards.
    fn tunnel(&self, id: u32) -> Option<Tunnel>;

    fn append_traffic_stat(&self, stat: TrafficStat);

    fn append_system_log(&self, log: SystemLog);
}

// ─── In-Memory Implementation ───────────────────────────────────

/// Map-backed [`Store`]. Interior mutability with short lock scopes;
/// safe to share across every background task.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<u32, Node>>,
    rules: RwLock<HashMap<u32, ForwardRule>>,
    tunnels: RwLock<HashMap<u32, Tunnel>>,
    traffic_stats: RwLock<Vec<TrafficStat>>,
    system_logs: RwLock<Vec<SystemLog>>,
    next_id: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ..Self::default()
        }
    }

    fn alloc_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // Mutation surface used by the admin layer and the tests. The core
    // itself only goes through the `Store` trait.

    pub fn insert_node(&self, mut node: Node) -> Node {
        if node.id == 0 {
            node.id = self.alloc_id();
        }
        if node.secret.is_empty() {
            node.generate_secret();
        }
        self.nodes.write().unwrap().insert(node.id, node.clone());
        node
    }

    pub fn insert_rule(&self, mut rule: ForwardRule) -> ForwardRule {
        if rule.id == 0 {
            rule.id = self.alloc_id();
        }
        self.rules.write().unwrap().insert(rule.id, rule.clone());
        rule
    }

    pub fn insert_tunnel(&self, mut tunnel: Tunnel) -> Tunnel {
        if tunnel.id == 0 {
            tunnel.id = self.alloc_id();
        }
        for chain in &mut tunnel.chain_tunnels {
            if chain.id == 0 {
                chain.id = self.alloc_id();
            }
            chain.tunnel_id = tunnel.id;
        }
        for fwd in &mut tunnel.forwards {
            if fwd.id == 0 {
                fwd.id = self.alloc_id();
            }
            fwd.tunnel_id = tunnel.id;
        }
        self.tunnels
            .write()
            .unwrap()
            .insert(tunnel.id, tunnel.clone());
        tunnel
    }

    pub fn rule(&self, id: u32) -> Option<ForwardRule> {
        self.rules.read().unwrap().get(&id).cloned()
    }

    pub fn traffic_stats(&self) -> Vec<TrafficStat> {
        self.traffic_stats.read().unwrap().clone()
    }

    pub fn system_logs(&self) -> Vec<SystemLog> {
        self.system_logs.read().unwrap().clone()
    }
}

impl Store for MemoryStore {
    fn node(&self, id: u32) -> Option<Node> {
        self.nodes.read().unwrap().get(&id).cloned()
    }

    fn node_by_secret(&self, secret: &str) -> Option<Node> {
        if secret.is_empty() {
            return None;
        }
        self.nodes
            .read()
            .unwrap()
            .values()
            .find(|n| n.secret == secret)
            .cloned()
    }

    fn active_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .unwrap()
            .values()
            .filter(|n| n.is_active)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    fn online_node_count(&self) -> usize {
        self.nodes
            .read()
            .unwrap()
            .values()
            .filter(|n| n.is_active && n.latency_ms >= 0)
            .count()
    }

    fn mark_node_session(&self, id: u32, online: bool) {
        if let Some(node) = self.nodes.write().unwrap().get_mut(&id) {
            node.is_online = online;
            node.last_check = Some(Utc::now());
            node.updated_at = Utc::now();
        }
    }

    fn record_heartbeat(&self, id: u32) {
        if let Some(node) = self.nodes.write().unwrap().get_mut(&id) {
            node.is_online = true;
            node.last_check = Some(Utc::now());
            node.latency_ms = 0;
            node.updated_at = Utc::now();
        }
    }

    fn record_node_probe(&self, id: u32, latency_ms: i64) {
        if let Some(node) = self.nodes.write().unwrap().get_mut(&id) {
            node.latency_ms = latency_ms;
            node.last_check = Some(Utc::now());
            node.updated_at = Utc::now();
        }
    }

    fn active_rules(&self) -> Vec<ForwardRule> {
        let mut rules: Vec<ForwardRule> = self
            .rules
            .read()
            .unwrap()
            .values()
            .filter(|r| r.is_active)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    fn update_rule_traffic(&self, id: u32, up: u64, down: u64, connections: i64) {
        if let Some(rule) = self.rules.write().unwrap().get_mut(&id) {
            rule.traffic_up = up as i64;
            rule.traffic_down = down as i64;
            rule.connections = connections;
            rule.updated_at = Utc::now();
        }
    }

    fn tunnel(&self, id: u32) -> Option<Tunnel> {
        let mut tunnel = self.tunnels.read().unwrap().get(&id).cloned()?;
        let nodes = self.nodes.read().unwrap();
        for chain in &mut tunnel.chain_tunnels {
            chain.node = nodes.get(&chain.node_id).cloned();
        }
        Some(tunnel)
    }

    fn append_traffic_stat(&self, mut stat: TrafficStat) {
        let mut stats = self.traffic_stats.write().unwrap();
        stat.id = self.alloc_id();
        stats.push(stat);
    }

    fn append_system_log(&self, mut log: SystemLog) {
        let mut logs = self.system_logs.write().unwrap();
        log.id = self.alloc_id();
        logs.push(log);
    }
}
