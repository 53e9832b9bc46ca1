//! # Node Checker
//!
//! Periodic TCP reachability probe over all active nodes. Latency is
//! written back to the store (−1 when unreachable) and every
//! offline↔online transition emits a warn-level system log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::forwarder::join_host_port;
use crate::models::Node;
use crate::store::Store;
use crate::syslog::SystemLogger;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const MODULE: &str = "node_checker";

pub struct NodeChecker {
    store: Arc<dyn Store>,
    logger: SystemLogger,
}

impl NodeChecker {
    pub fn new(store: Arc<dyn Store>, logger: SystemLogger) -> Self {
        Self { store, logger }
    }

    /// Probes one node and writes the result back. Also used by the
    /// admin layer for on-demand checks. Returns the measured latency,
    /// −1 when the dial failed.
    pub async fn check_node(&self, node: &Node) -> i64 {
        let addr = join_host_port(&node.host, node.ssh_port);
        let start = Instant::now();
        let latency = match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_conn)) => start.elapsed().as_millis() as i64,
            _ => -1,
        };
        debug!(node = node.id, %addr, latency, "probe");

        let was_online = node.latency_ms >= 0;
        self.store.record_node_probe(node.id, latency);

        let is_online = latency >= 0;
        if was_online != is_online {
            let status = if is_online { "online" } else { "offline" };
            self.logger.warn(
                MODULE,
                format!("node {}({}) => {}", node.name, node.host, status),
            );
        }
        latency
    }

    async fn sweep(&self) {
        for node in self.store.active_nodes() {
            self.check_node(&node).await;
        }
    }

    /// Spawns the 60 s sweep loop; stops with the token.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.sweep().await,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::net::TcpListener;

    fn checker() -> (NodeChecker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let logger = SystemLogger::new(store.clone());
        (NodeChecker::new(store.clone(), logger), store)
    }

    #[tokio::test]
    async fn reachable_node_gets_latency_and_one_flip_log() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let (checker, store) = checker();
        let node = store.insert_node(Node {
            name: "edge-1".into(),
            host: "127.0.0.1".into(),
            ssh_port: port,
            ..Node::default()
        });

        // Fresh nodes are offline (latency −1); the first success flips.
        let latency = checker.check_node(&node).await;
        assert!(latency >= 0);
        assert_eq!(store.node(node.id).unwrap().latency_ms, latency);
        assert_eq!(store.system_logs().len(), 1);
        assert!(store.system_logs()[0].message.contains("=> online"));

        // A second success is not a transition; no extra log line.
        let node = store.node(node.id).unwrap();
        checker.check_node(&node).await;
        assert_eq!(store.system_logs().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_node_flips_back_offline() {
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let (checker, store) = checker();
        let mut seed = Node {
            name: "edge-2".into(),
            host: "127.0.0.1".into(),
            ssh_port: dead_port,
            ..Node::default()
        };
        seed.latency_ms = 4; // previously online
        let node = store.insert_node(seed);

        let latency = checker.check_node(&node).await;
        assert_eq!(latency, -1);
        assert_eq!(store.node(node.id).unwrap().latency_ms, -1);
        let logs = store.system_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].message.contains("=> offline"));
        assert_eq!(logs[0].level, "warn");
    }
}
