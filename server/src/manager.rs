//! # Forward Manager
//!
//! Owns the live forwarder instances, keyed by rule id. The HTTP layer
//! calls [`ForwardManager::start`] / [`stop`] / [`reload`] when rules
//! change; a background loop writes live counters back to the store
//! every five seconds.
//!
//! [`stop`]: ForwardManager::stop
//! [`reload`]: ForwardManager::reload

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{FabricError, Result};
use crate::forwarder::balancer::{LoadBalancer, Strategy};
use crate::forwarder::{Forwarder, ForwarderStats, TcpForwarder, UdpForwarder};
use crate::models::{ForwardRule, RuleProtocol};
use crate::store::Store;

const PERSIST_INTERVAL: Duration = Duration::from_secs(5);
const LISTEN_HOST: &str = "0.0.0.0";

/// Everything that lives for one started rule: the forwarder itself and,
/// when the rule is load balanced, the balancer with its probe task.
struct RuleRuntime {
    forwarder: Arc<Forwarder>,
    balancer: Option<Arc<LoadBalancer>>,
    probe_cancel: CancellationToken,
}

impl RuleRuntime {
    async fn shutdown(&self) {
        self.probe_cancel.cancel();
        let _ = self.forwarder.stop().await;
    }
}

pub struct ForwardManager {
    store: Arc<dyn Store>,
    forwarders: RwLock<HashMap<u32, Arc<RuleRuntime>>>,
}

impl ForwardManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            forwarders: RwLock::new(HashMap::new()),
        }
    }

    /// Builds the forwarder for a rule: the protocol picks TCP vs UDP,
    /// and a non-empty target list routes the upstream through the load
    /// balancer (initial pick now, active probing in the background).
    fn build(&self, rule: &ForwardRule) -> RuleRuntime {
        let mut target_host = rule.target_address.clone();
        let mut target_port = rule.target_port;

        let probe_cancel = CancellationToken::new();
        let balancer = if rule.lb_targets.is_empty() {
            None
        } else {
            let lb = Arc::new(LoadBalancer::new(
                Strategy::from_tag(&rule.lb_strategy),
                &rule.lb_targets,
            ));
            lb.spawn_health_probe(probe_cancel.clone());
            if let Some(selected) = lb.select() {
                target_host = selected.address;
                target_port = selected.port;
            }
            Some(lb)
        };

        let forwarder = match rule.protocol {
            RuleProtocol::Udp => Forwarder::Udp(UdpForwarder::new(
                LISTEN_HOST,
                rule.listen_port,
                &target_host,
                target_port,
                rule.bandwidth_limit,
            )),
            RuleProtocol::Tcp => Forwarder::Tcp(TcpForwarder::new(
                LISTEN_HOST,
                rule.listen_port,
                &target_host,
                target_port,
                rule.bandwidth_limit,
            )),
        };

        RuleRuntime {
            forwarder: Arc::new(forwarder),
            balancer,
            probe_cancel,
        }
    }

    /// Starts the rule's forwarder and records it. A bind failure is
    /// surfaced to the caller; the rule stays recorded in the store but
    /// not live.
    pub async fn start(&self, rule: &ForwardRule) -> Result<()> {
        if self.forwarders.read().unwrap().contains_key(&rule.id) {
            return Err(FabricError::RuleAlreadyStarted(rule.id));
        }

        let runtime = Arc::new(self.build(rule));
        runtime.forwarder.start().await?;

        let raced = {
            let mut map = self.forwarders.write().unwrap();
            if map.contains_key(&rule.id) {
                true
            } else {
                map.insert(rule.id, runtime.clone());
                false
            }
        };
        if raced {
            runtime.shutdown().await;
            return Err(FabricError::RuleAlreadyStarted(rule.id));
        }

        info!(rule = rule.id, port = rule.listen_port, "rule started");
        Ok(())
    }

    /// Idempotent: stopping an unknown rule id is a no-op.
    pub async fn stop(&self, rule_id: u32) -> Result<()> {
        let runtime = self.forwarders.write().unwrap().remove(&rule_id);
        if let Some(runtime) = runtime {
            runtime.shutdown().await;
            info!(rule = rule_id, "rule stopped");
        }
        Ok(())
    }

    /// Stop, then start again if the rule is still active.
    pub async fn reload(&self, rule: &ForwardRule) -> Result<()> {
        self.stop(rule.id).await?;
        if !rule.is_active {
            return Ok(());
        }
        self.start(rule).await
    }

    /// Starts every active rule from the store. Individual failures are
    /// logged and skipped so one bad rule cannot block the rest.
    pub async fn start_all(&self) {
        for rule in self.store.active_rules() {
            if let Err(e) = self.start(&rule).await {
                warn!(rule = rule.id, error = %e, "failed to start rule");
            }
        }
    }

    /// Snapshot of live counters for every running rule.
    pub fn stats(&self) -> HashMap<u32, ForwarderStats> {
        self.forwarders
            .read()
            .unwrap()
            .iter()
            .map(|(&id, rt)| (id, rt.forwarder.stats()))
            .collect()
    }

    pub fn stats_of(&self, rule_id: u32) -> Option<ForwarderStats> {
        self.forwarders
            .read()
            .unwrap()
            .get(&rule_id)
            .map(|rt| rt.forwarder.stats())
    }

    pub fn balancer_of(&self, rule_id: u32) -> Option<Arc<LoadBalancer>> {
        self.forwarders
            .read()
            .unwrap()
            .get(&rule_id)
            .and_then(|rt| rt.balancer.clone())
    }

    pub fn is_running(&self, rule_id: u32) -> bool {
        self.forwarders.read().unwrap().contains_key(&rule_id)
    }

    /// Background loop writing live counters back onto the rule rows.
    pub fn spawn_persist_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PERSIST_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for (id, stats) in manager.stats() {
                            manager.store.update_rule_traffic(
                                id,
                                stats.up_bytes,
                                stats.down_bytes,
                                stats.connections,
                            );
                        }
                    }
                }
            }
        });
    }
}
