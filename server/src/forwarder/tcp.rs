//! # TCP Forwarder
//!
//! Listens on a local address and shuttles every accepted connection to
//! the upstream target. Each connection gets a handler task running two
//! copy directions; the client→upstream direction goes through the
//! token bucket when a bandwidth limit is configured.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ratelimit::TokenBucket;
use super::{join_host_port, ForwarderStats, TrafficCounters};
use crate::error::{FabricError, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);
const COPY_BUF_SIZE: usize = 8192;

pub struct TcpForwarder {
    listen_addr: String,
    target_addr: String,
    limiter: Arc<TokenBucket>,
    counters: Arc<TrafficCounters>,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpForwarder {
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
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
        }
    }

    /// Binds the listener and spawns the accept loop. Fails without side
    /// effect when already started; a bind failure leaves the forwarder
    /// startable again.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FabricError::ForwarderRunning);
        }
        let listener = match TcpListener::bind(&self.listen_addr).await {
            Ok(l) => l,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        debug!(listen = %self.listen_addr, target = %self.target_addr, "tcp forwarder started");

        let handle = tokio::spawn(accept_loop(
            listener,
            self.target_addr.clone(),
            self.limiter.clone(),
            self.counters.clone(),
            self.cancel.clone(),
        ));
        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    /// Idempotent. Cancels the accept loop and every connection handler,
    /// then waits for all of them before returning.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(handle) = self.accept_task.lock().await.take() {
            let _ = handle.await;
        }
        debug!(listen = %self.listen_addr, "tcp forwarder stopped");
        Ok(())
    }

    pub fn stats(&self) -> ForwarderStats {
        self.counters.snapshot()
    }

    pub fn counters(&self) -> Arc<TrafficCounters> {
        self.counters.clone()
    }
}

async fn accept_loop(
    listener: TcpListener,
    target_addr: String,
    limiter: Arc<TokenBucket>,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    debug!(%peer, "accepted connection");
                    counters.conn_opened();
                    handlers.spawn(handle_conn(
                        inbound,
                        target_addr.clone(),
                        limiter.clone(),
                        counters.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
    // The listener is released here; outstanding handlers observe the
    // cancelled token and are drained before the loop task exits, so
    // `stop()` returns only after the last counter update.
    drop(listener);
    while handlers.join_next().await.is_some() {}
}

async fn handle_conn(
    inbound: TcpStream,
    target_addr: String,
    limiter: Arc<TokenBucket>,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
) {
    let outbound = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target_addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(target = %target_addr, error = %e, "upstream dial failed");
            counters.conn_closed();
            return;
        }
        Err(_) => {
            warn!(target = %target_addr, "upstream dial timed out");
            counters.conn_closed();
            return;
        }
    };

    let (client_read, client_write) = inbound.into_split();
    let (upstream_read, upstream_write) = outbound.into_split();

    let up = pump(
        client_read,
        upstream_write,
        counters.clone(),
        Direction::Up,
        Some(limiter),
    );
    let down = pump(
        upstream_read,
        client_write,
        counters.clone(),
        Direction::Down,
        None,
    );

    // First direction to finish ends the handler; dropping the other
    // copy future releases both sockets.
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = up => {}
        _ = down => {}
    }
    counters.conn_closed();
}

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

async fn pump(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    counters: Arc<TrafficCounters>,
    direction: Direction,
    limiter: Option<Arc<TokenBucket>>,
) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if let Some(limiter) = &limiter {
            limiter.wait(n).await;
        }
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        match direction {
            Direction::Up => counters.add_up(n as u64),
            Direction::Down => counters.add_down(n as u64),
        }
    }
}
