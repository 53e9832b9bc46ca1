//! # Load Balancer
//!
//! Upstream target selection with passive health feedback and an active
//! TCP probe. Selection only considers healthy non-backup targets and
//! falls back to healthy backups when the primary set is empty.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::join_host_port;
use crate::models::LbTargetSpec;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const FAIL_THRESHOLD: u32 = 3;

// ─── Strategy ───────────────────────────────────────────────────

/// Target-selection strategy. Unknown tags fall back to round-robin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    Random,
    LeastConn,
    Failover,
}

impl Strategy {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "weighted_round_robin" => Strategy::WeightedRoundRobin,
            "random" => Strategy::Random,
            "least_conn" => Strategy::LeastConn,
            "failover" => Strategy::Failover,
            _ => Strategy::RoundRobin,
        }
    }
}

// ─── Targets ────────────────────────────────────────────────────

struct Target {
    address: String,
    port: u16,
    weight: i32,
    is_backup: bool,
    healthy: bool,
    fail_count: u32,
    active_conn: i64,
}

impl Target {
    fn addr(&self) -> String {
        join_host_port(&self.address, self.port)
    }

    fn record(&mut self, ok: bool) {
        if ok {
            self.fail_count = 0;
            self.healthy = true;
        } else {
            self.fail_count += 1;
            if self.fail_count >= FAIL_THRESHOLD {
                self.healthy = false;
            }
        }
    }
}

/// A selected upstream: stable index for result reporting plus the
/// address to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    pub address: String,
    pub port: u16,
}

impl Selection {
    pub fn addr(&self) -> String {
        join_host_port(&self.address, self.port)
    }
}

struct Inner {
    targets: Vec<Target>,
    rr_index: usize,
}

pub struct LoadBalancer {
    strategy: Strategy,
    inner: Mutex<Inner>,
}

impl LoadBalancer {
    /// Targets start healthy; non-positive weights are normalized to 1.
    pub fn new(strategy: Strategy, specs: &[LbTargetSpec]) -> Self {
        let targets = specs
            .iter()
            .map(|s| Target {
                address: s.address.clone(),
                port: s.port,
                weight: s.weight.max(1),
                is_backup: s.is_backup,
                healthy: true,
                fail_count: 0,
                active_conn: 0,
            })
            .collect();
        Self {
            strategy,
            inner: Mutex::new(Inner {
                targets,
                rr_index: 0,
            }),
        }
    }

    /// Picks an upstream among healthy non-backup targets, then healthy
    /// backups; `None` when nothing is healthy.
    pub fn select(&self) -> Option<Selection> {
        let mut inner = self.inner.lock().unwrap();

        let mut candidates: Vec<usize> = (0..inner.targets.len())
            .filter(|&i| inner.targets[i].healthy && !inner.targets[i].is_backup)
            .collect();
        if candidates.is_empty() {
            candidates = (0..inner.targets.len())
                .filter(|&i| inner.targets[i].healthy)
                .collect();
        }
        if candidates.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            Strategy::Random => candidates[rand::thread_rng().gen_range(0..candidates.len())],
            Strategy::Failover => candidates[0],
            Strategy::LeastConn => {
                let &best = candidates
                    .iter()
                    .min_by_key(|&&i| inner.targets[i].active_conn)
                    .expect("candidates is non-empty");
                inner.targets[best].active_conn += 1;
                best
            }
            Strategy::WeightedRoundRobin => {
                let expanded: Vec<usize> = candidates
                    .iter()
                    .flat_map(|&i| {
                        std::iter::repeat(i).take(inner.targets[i].weight.max(1) as usize)
                    })
                    .collect();
                inner.rr_index = (inner.rr_index + 1) % expanded.len();
                expanded[inner.rr_index]
            }
            Strategy::RoundRobin => {
                inner.rr_index = (inner.rr_index + 1) % candidates.len();
                candidates[inner.rr_index]
            }
        };

        Some(Selection {
            index: chosen,
            address: inner.targets[chosen].address.clone(),
            port: inner.targets[chosen].port,
        })
    }

    /// Passive health feedback for a previously selected target. Three
    /// consecutive failures mark it unhealthy; one success restores it.
    pub fn report_result(&self, index: usize, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(target) = inner.targets.get_mut(index) else {
            return;
        };
        if target.active_conn > 0 {
            target.active_conn -= 1;
        }
        target.record(ok);
    }

    /// One active-probe pass: TCP dial against every target, feeding the
    /// same strike counter as passive feedback.
    pub async fn probe_once(&self) {
        let addrs: Vec<(usize, String)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .targets
                .iter()
                .enumerate()
                .map(|(i, t)| (i, t.addr()))
                .collect()
        };
        for (index, addr) in addrs {
            let ok = matches!(
                tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await,
                Ok(Ok(_))
            );
            if !ok {
                debug!(%addr, "health probe failed");
            }
            let mut inner = self.inner.lock().unwrap();
            if let Some(target) = inner.targets.get_mut(index) {
                let was_healthy = target.healthy;
                target.record(ok);
                if was_healthy != target.healthy {
                    warn!(%addr, healthy = target.healthy, "target health changed");
                }
            }
        }
    }

    /// Spawns the 30 s active probe loop; it stops with the token.
    pub fn spawn_health_probe(self: &Arc<Self>, cancel: CancellationToken) {
        let balancer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROBE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => balancer.probe_once().await,
                }
            }
        });
    }

    #[cfg(test)]
    fn is_healthy(&self, index: usize) -> bool {
        self.inner.lock().unwrap().targets[index].healthy
    }

    #[cfg(test)]
    fn active_conn(&self, index: usize) -> i64 {
        self.inner.lock().unwrap().targets[index].active_conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn spec(address: &str, port: u16, weight: i32, backup: bool) -> LbTargetSpec {
        LbTargetSpec {
            address: address.into(),
            port,
            weight,
            is_backup: backup,
        }
    }

    #[test]
    fn unknown_strategy_tags_fall_back_to_round_robin() {
        assert_eq!(Strategy::from_tag(""), Strategy::RoundRobin);
        assert_eq!(Strategy::from_tag("bogus"), Strategy::RoundRobin);
        assert_eq!(Strategy::from_tag("least_conn"), Strategy::LeastConn);
    }

    #[test]
    fn round_robin_cycles_over_primaries_only() {
        let lb = LoadBalancer::new(
            Strategy::RoundRobin,
            &[
                spec("10.0.0.1", 80, 1, false),
                spec("10.0.0.2", 80, 1, false),
                spec("10.0.0.3", 80, 1, true),
            ],
        );
        let picks: Vec<usize> = (0..4).map(|_| lb.select().unwrap().index).collect();
        assert!(picks.iter().all(|&i| i < 2), "backup selected: {picks:?}");
        assert!(picks.contains(&0) && picks.contains(&1));
    }

    #[test]
    fn three_strikes_mark_unhealthy_and_backups_take_over() {
        let lb = LoadBalancer::new(
            Strategy::RoundRobin,
            &[spec("10.0.0.1", 80, 1, false), spec("10.0.0.9", 80, 1, true)],
        );
        for _ in 0..FAIL_THRESHOLD {
            lb.report_result(0, false);
        }
        assert!(!lb.is_healthy(0));
        // Primary set is empty, so the healthy backup is used.
        assert_eq!(lb.select().unwrap().index, 1);

        // Everything unhealthy yields no selection.
        for _ in 0..FAIL_THRESHOLD {
            lb.report_result(1, false);
        }
        assert!(lb.select().is_none());

        // One success restores a target.
        lb.report_result(0, true);
        assert_eq!(lb.select().unwrap().index, 0);
    }

    #[test]
    fn least_conn_prefers_the_idle_target_and_tracks_the_gauge() {
        let lb = LoadBalancer::new(
            Strategy::LeastConn,
            &[spec("10.0.0.1", 80, 1, false), spec("10.0.0.2", 80, 1, false)],
        );
        let first = lb.select().unwrap().index;
        let second = lb.select().unwrap().index;
        assert_ne!(first, second);
        assert_eq!(lb.active_conn(first), 1);

        lb.report_result(first, true);
        assert_eq!(lb.active_conn(first), 0);
        assert_eq!(lb.select().unwrap().index, first);
    }

    #[test]
    fn weighted_round_robin_respects_weights() {
        let lb = LoadBalancer::new(
            Strategy::WeightedRoundRobin,
            &[spec("10.0.0.1", 80, 3, false), spec("10.0.0.2", 80, 1, false)],
        );
        let mut counts = [0usize; 2];
        for _ in 0..40 {
            counts[lb.select().unwrap().index] += 1;
        }
        assert_eq!(counts[0], 30);
        assert_eq!(counts[1], 10);
    }

    #[test]
    fn failover_sticks_to_the_first_healthy_target() {
        let lb = LoadBalancer::new(
            Strategy::Failover,
            &[spec("10.0.0.1", 80, 1, false), spec("10.0.0.2", 80, 1, false)],
        );
        assert_eq!(lb.select().unwrap().index, 0);
        assert_eq!(lb.select().unwrap().index, 0);
        for _ in 0..FAIL_THRESHOLD {
            lb.report_result(0, false);
        }
        assert_eq!(lb.select().unwrap().index, 1);
    }

    #[tokio::test]
    async fn active_probe_restores_a_reachable_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let alive = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        // A bound-then-dropped port is reliably refused.
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let lb = LoadBalancer::new(
            Strategy::RoundRobin,
            &[
                spec("127.0.0.1", alive.port(), 1, false),
                spec("127.0.0.1", dead, 1, false),
            ],
        );
        // Knock the reachable target out passively, then let the probe
        // bring it back while striking the dead one.
        for _ in 0..FAIL_THRESHOLD {
            lb.report_result(0, false);
        }
        assert!(!lb.is_healthy(0));

        for _ in 0..FAIL_THRESHOLD {
            lb.probe_once().await;
        }
        assert!(lb.is_healthy(0));
        assert!(!lb.is_healthy(1));
    }
}
