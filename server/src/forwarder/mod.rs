//! # Local Forwarder Runtime
//!
//! In-process TCP/UDP port forwarding with per-rule statistics, optional
//! token-bucket rate limiting, and load-balanced upstream selection.
//!
//! ## Modules
//!
//! - [`tcp`]       - accept-loop forwarder with full-duplex copy tasks
//! - [`udp`]       - datagram forwarder with bounded request tasks
//! - [`ratelimit`] - token-bucket limiter applied client→upstream
//! - [`balancer`]  - target selection and health tracking

pub mod balancer;
pub mod ratelimit;
pub mod tcp;
pub mod udp;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::Result;

pub use tcp::TcpForwarder;
pub use udp::UdpForwarder;

// ─── Statistics ─────────────────────────────────────────────────

/// Shared per-forwarder counters. Byte counters are monotonic for the
/// forwarder's lifetime; the connection field is a gauge.
#[derive(Default)]
pub struct TrafficCounters {
    up_bytes: AtomicU64,
    down_bytes: AtomicU64,
    connections: AtomicI64,
    last_activity: AtomicI64,
}

impl TrafficCounters {
    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn add_up(&self, n: u64) {
        self.up_bytes.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_down(&self, n: u64) {
        self.down_bytes.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn conn_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn conn_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Coarse activity marker used by the UDP loop, which has no
    /// per-flow connection tracking.
    pub fn mark_active(&self) {
        self.connections.store(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn snapshot(&self) -> ForwarderStats {
        ForwarderStats {
            up_bytes: self.up_bytes.load(Ordering::Relaxed),
            down_bytes: self.down_bytes.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            last_activity: Utc
                .timestamp_opt(self.last_activity.load(Ordering::Relaxed), 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Point-in-time view of one forwarder's counters.
#[derive(Debug, Clone, Serialize)]
pub struct ForwarderStats {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub connections: i64,
    pub last_activity: DateTime<Utc>,
}

// ─── Forwarder Dispatch ─────────────────────────────────────────

/// A live forwarding engine bound to one rule. Protocol is fixed at
/// construction; the manager treats both variants uniformly.
pub enum Forwarder {
    Tcp(TcpForwarder),
    Udp(UdpForwarder),
}

impl Forwarder {
    pub async fn start(&self) -> Result<()> {
        match self {
            Forwarder::Tcp(f) => f.start().await,
            Forwarder::Udp(f) => f.start().await,
        }
    }

    /// Idempotent. Returns once every task owned by the forwarder has
    /// exited; no counter updates happen afterwards.
    pub async fn stop(&self) -> Result<()> {
        match self {
            Forwarder::Tcp(f) => f.stop().await,
            Forwarder::Udp(f) => f.stop().await,
        }
    }

    pub fn stats(&self) -> ForwarderStats {
        match self {
            Forwarder::Tcp(f) => f.stats(),
            Forwarder::Udp(f) => f.stats(),
        }
    }

    pub fn counters(&self) -> Arc<TrafficCounters> {
        match self {
            Forwarder::Tcp(f) => f.counters(),
            Forwarder::Udp(f) => f.counters(),
        }
    }
}

/// Joins host and port into a dial/listen address.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
