//! # UDP Forwarder
//!
//! Request/response datagram forwarding. Every client datagram is sent
//! through a fresh ephemeral upstream socket; at most one reply is
//! relayed back to the originating client address. The read loop uses a
//! short deadline so a stop request is observed promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::ratelimit::TokenBucket;
use super::{join_host_port, ForwarderStats, TrafficCounters};
use crate::error::{FabricError, Result};

const READ_DEADLINE: Duration = Duration::from_secs(2);
const REPLY_DEADLINE: Duration = Duration::from_secs(3);
const MAX_DATAGRAM: usize = 65535;

pub struct UdpForwarder {
    listen_addr: String,
    target_addr: String,
    limiter: Arc<TokenBucket>,
    counters: Arc<TrafficCounters>,
    started: AtomicBool,
    closed: Arc<AtomicBool>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpForwarder {
    pub fn new(
        listen_host: &str,
        listen_port: u16,
        target_host: &str,
        target_port: u16,
        bandwidth_limit: i64,
    ) -> Self {
        Self {
            listen_addr: join_host_port(listen_host, listen_port),
            target_addr: join_host_port(target_host, target_port),
            limiter: Arc::new(TokenBucket::new(bandwidth_limit)),
            counters: Arc::new(TrafficCounters::default()),
            started: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            loop_task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FabricError::ForwarderRunning);
        }
        let socket = match UdpSocket::bind(&self.listen_addr).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        debug!(listen = %self.listen_addr, target = %self.target_addr, "udp forwarder started");

        let handle = tokio::spawn(read_loop(
            socket,
            self.target_addr.clone(),
            self.limiter.clone(),
            self.counters.clone(),
            self.closed.clone(),
        ));
        *self.loop_task.lock().await = Some(handle);
        Ok(())
    }

    /// Idempotent. The read loop observes the closed flag within one
    /// read deadline; outstanding request tasks are drained before this
    /// returns.
    pub async fn stop(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.loop_task.lock().await.take() {
            let _ = handle.await;
        }
        debug!(listen = %self.listen_addr, "udp forwarder stopped");
        Ok(())
    }

    pub fn stats(&self) -> ForwarderStats {
        self.counters.snapshot()
    }

    pub fn counters(&self) -> Arc<TrafficCounters> {
        self.counters.clone()
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    target_addr: String,
    limiter: Arc<TokenBucket>,
    counters: Arc<TrafficCounters>,
    closed: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut requests = JoinSet::new();
    while !closed.load(Ordering::SeqCst) {
        // Reap finished request tasks without blocking the loop.
        while requests.try_join_next().is_some() {}

        let (n, client) = match tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await
        {
            Err(_) => continue,
            Ok(Err(e)) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, "udp read failed");
                continue;
            }
            Ok(Ok(hit)) => hit,
        };

        counters.mark_active();
        limiter.wait(n).await;
        counters.add_up(n as u64);

        let datagram = buf[..n].to_vec();
        requests.spawn(relay_datagram(
            socket.clone(),
            target_addr.clone(),
            datagram,
            client,
            counters.clone(),
        ));
    }
    while requests.join_next().await.is_some() {}
}

/// Sends one datagram upstream and relays at most one reply back. The
/// reply deadline bounds the task even against a silent upstream.
async fn relay_datagram(
    socket: Arc<UdpSocket>,
    target_addr: String,
    datagram: Vec<u8>,
    client: std::net::SocketAddr,
    counters: Arc<TrafficCounters>,
) {
    let upstream = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "udp upstream bind failed");
            return;
        }
    };
    if let Err(e) = upstream.connect(&target_addr).await {
        warn!(target = %target_addr, error = %e, "udp upstream dial failed");
        return;
    }
    if upstream.send(&datagram).await.is_err() {
        return;
    }

    let mut reply = vec![0u8; MAX_DATAGRAM];
    match tokio::time::timeout(REPLY_DEADLINE, upstream.recv(&mut reply)).await {
        Ok(Ok(rn)) if rn > 0 => {
            if socket.send_to(&reply[..rn], client).await.is_ok() {
                counters.add_down(rn as u64);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// UDP echo server on an ephemeral port.
    async fn spawn_udp_echo() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        port
    }

    async fn ephemeral_udp_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn relays_request_and_reply() {
        let echo_port = spawn_udp_echo().await;
        let listen_port = ephemeral_udp_port().await;

        let fwd = UdpForwarder::new("127.0.0.1", listen_port, "127.0.0.1", echo_port, 0);
        fwd.start().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"ping", ("127.0.0.1", listen_port))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("no reply relayed")
            .unwrap();
        assert_eq!(&buf[..n], b"ping");

        let stats = fwd.stats();
        assert!(stats.up_bytes >= 4);
        assert!(stats.down_bytes >= 4);
        assert_eq!(stats.connections, 1);

        fwd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn survives_a_silent_upstream() {
        let dead_port = ephemeral_udp_port().await;
        let listen_port = ephemeral_udp_port().await;

        let fwd = UdpForwarder::new("127.0.0.1", listen_port, "127.0.0.1", dead_port, 0);
        fwd.start().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"into the void", ("127.0.0.1", listen_port))
            .await
            .unwrap();

        // No reply ever arrives, but the forwarder keeps serving and
        // stop() still completes once the bounded request task ends.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fwd.stats().up_bytes >= 13);
        fwd.stop().await.unwrap();
    }
}
