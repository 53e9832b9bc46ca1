//! # Telemetry Aggregator
//!
//! Samples rule counters and host metrics once per second, keeps the
//! last sixty snapshots as a rolling history, and persists an aggregate
//! row every five seconds. The latest snapshot feeds the monitoring API
//! and its WebSocket fan-out, both of which live outside this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{Local, Utc};
use serde::Serialize;
use sysinfo::{Networks, System};
use tokio_util::sync::CancellationToken;

use crate::manager::ForwardManager;
use crate::models::TrafficStat;
use crate::store::Store;

const COLLECT_INTERVAL: Duration = Duration::from_secs(1);
const PERSIST_INTERVAL: Duration = Duration::from_secs(5);
const HISTORY_LEN: usize = 60;

/// Per-rule counter triple inside a snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RuleLiveStats {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub connections: i64,
}

/// One aggregated observation of the whole fabric.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSnapshot {
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub net_in: i64,
    pub net_out: i64,
    pub total_up: u64,
    pub total_down: u64,
    pub total_conn: i64,
    pub rule_stats: HashMap<u32, RuleLiveStats>,
    pub active_rules: usize,
    pub online_nodes: usize,
}

#[derive(Default)]
struct CollectorState {
    latest: MonitorSnapshot,
    history: VecDeque<MonitorSnapshot>,
}

pub struct TrafficCollector {
    manager: Arc<ForwardManager>,
    store: Arc<dyn Store>,
    state: RwLock<CollectorState>,
}

impl TrafficCollector {
    pub fn new(manager: Arc<ForwardManager>, store: Arc<dyn Store>) -> Self {
        Self {
            manager,
            store,
            state: RwLock::new(CollectorState::default()),
        }
    }

    /// Spawns the collect/persist loop; both tickers stop with the token.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let collector = self.clone();
        tokio::spawn(async move {
            let mut sampler = HostSampler::new();
            let mut collect = tokio::time::interval(COLLECT_INTERVAL);
            let mut persist = tokio::time::interval(PERSIST_INTERVAL);
            collect.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            persist.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = collect.tick() => collector.collect(&mut sampler),
                    _ = persist.tick() => collector.persist(),
                }
            }
        });
    }

    /// One collect tick: rule counters, host sample, online-node count.
    fn collect(&self, sampler: &mut HostSampler) {
        let mut snap = MonitorSnapshot {
            timestamp: Utc::now().timestamp(),
            ..MonitorSnapshot::default()
        };

        for (id, stats) in self.manager.stats() {
            snap.rule_stats.insert(
                id,
                RuleLiveStats {
                    up_bytes: stats.up_bytes,
                    down_bytes: stats.down_bytes,
                    connections: stats.connections,
                },
            );
            snap.total_up += stats.up_bytes;
            snap.total_down += stats.down_bytes;
            snap.total_conn += stats.connections;
        }
        snap.active_rules = snap.rule_stats.len();

        let host = sampler.sample();
        snap.cpu_percent = host.cpu_percent;
        snap.mem_percent = host.mem_percent;
        snap.net_in = host.net_in;
        snap.net_out = host.net_out;

        snap.online_nodes = self.store.online_node_count();

        self.record(snap);
    }

    fn record(&self, snap: MonitorSnapshot) {
        let mut state = self.state.write().unwrap();
        state.history.push_back(snap.clone());
        while state.history.len() > HISTORY_LEN {
            state.history.pop_front();
        }
        state.latest = snap;
    }

    /// One persist tick: append the latest totals as a dated row. Skipped
    /// until the first collect tick has produced a snapshot.
    fn persist(&self) {
        let latest = self.state.read().unwrap().latest.clone();
        if latest.timestamp == 0 {
            return;
        }
        self.store.append_traffic_stat(TrafficStat {
            rule_id: 0,
            date: Local::now().format("%Y-%m-%d").to_string(),
            traffic_up: latest.total_up as i64,
            traffic_down: latest.total_down as i64,
            connections: latest.total_conn,
            cpu_percent: latest.cpu_percent,
            mem_percent: latest.mem_percent,
            net_in: latest.net_in,
            net_out: latest.net_out,
            ..TrafficStat::default()
        });
    }

    pub fn latest(&self) -> MonitorSnapshot {
        self.state.read().unwrap().latest.clone()
    }

    pub fn history(&self) -> Vec<MonitorSnapshot> {
        self.state.read().unwrap().history.iter().cloned().collect()
    }
}

// ─── Host Sampling ──────────────────────────────────────────────

struct HostSample {
    cpu_percent: f64,
    mem_percent: f64,
    net_in: i64,
    net_out: i64,
}

/// Wraps the sysinfo handles plus the previous network totals so each
/// sample reports a delta. The first sample primes the totals and
/// reports zero.
struct HostSampler {
    sys: System,
    networks: Networks,
    prev_in: u64,
    prev_out: u64,
}

impl HostSampler {
    fn new() -> Self {
        Self {
            sys: System::new(),
            networks: Networks::new_with_refreshed_list(),
            prev_in: 0,
            prev_out: 0,
        }
    }

    fn sample(&mut self) -> HostSample {
        self.sys.refresh_cpu();
        let cpu_percent = f64::from(self.sys.global_cpu_info().cpu_usage());

        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let mem_percent = if total == 0 {
            0.0
        } else {
            self.sys.used_memory() as f64 / total as f64 * 100.0
        };

        self.networks.refresh();
        let (mut total_in, mut total_out) = (0u64, 0u64);
        for (_name, data) in &self.networks {
            total_in += data.total_received();
            total_out += data.total_transmitted();
        }
        if self.prev_in == 0 {
            self.prev_in = total_in;
            self.prev_out = total_out;
        }
        let net_in = total_in.saturating_sub(self.prev_in) as i64;
        let net_out = total_out.saturating_sub(self.prev_out) as i64;
        self.prev_in = total_in;
        self.prev_out = total_out;

        HostSample {
            cpu_percent,
            mem_percent,
            net_in,
            net_out,
        }
    }
}
