//! # Agent Hub
//!
//! The controller side of the node-agent fabric: a registry of live
//! encrypted sessions plus request/response correlation for commands.
//!
//! Sessions register when an agent completes the WebSocket upgrade and
//! unregister when their reader task ends. Commands are fire-and-await:
//! [`AgentHub::send_to_node`] installs a one-shot reply slot keyed by
//! the request id, sends, and waits for the matching `response` report
//! or the timeout. Commands are not buffered across disconnects; the
//! deployer re-issues idempotent commands instead.

pub mod crypto;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use fabric_protocol::{AgentCommand, AgentReport, ReportType};

use crate::error::{FabricError, Result};
use crate::store::Store;

pub use session::AgentSession;

/// Deadline applied by callers that have no opinion of their own.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentHub {
    store: Arc<dyn Store>,
    sessions: DashMap<u32, Arc<AgentSession>>,
    pending: DashMap<String, oneshot::Sender<AgentReport>>,
}

impl AgentHub {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    // ── Registry ────────────────────────────────────────────────

    /// Installs a session for its node, closing any session that was
    /// already registered there, and marks the node online.
    pub async fn register(&self, session: Arc<AgentSession>) {
        let node_id = session.node_id;
        if let Some((_, old)) = self.sessions.remove(&node_id) {
            warn!(node = node_id, "replacing existing agent session");
            old.close().await;
        }
        self.sessions.insert(node_id, session);
        self.store.mark_node_session(node_id, true);
        info!(node = node_id, "agent registered");
    }

    /// Removes and closes the session, marking the node offline. Only
    /// acts when `session` is still the registered one, so a stale
    /// reader cannot tear down the session that replaced it.
    pub async fn unregister(&self, session: &Arc<AgentSession>) {
        let node_id = session.node_id;
        let removed = self
            .sessions
            .remove_if(&node_id, |_, current| Arc::ptr_eq(current, session));
        if removed.is_some() {
            session.close().await;
            self.store.mark_node_session(node_id, false);
            info!(node = node_id, "agent unregistered");
        }
    }

    pub fn is_online(&self, node_id: u32) -> bool {
        self.sessions.contains_key(&node_id)
    }

    /// Connected agents as `(node_id, node_name)`, for the agents API.
    pub fn connected_agents(&self) -> Vec<(u32, String)> {
        let mut agents: Vec<(u32, String)> = self
            .sessions
            .iter()
            .map(|entry| (entry.node_id, entry.node_name.clone()))
            .collect();
        agents.sort_by_key(|(id, _)| *id);
        agents
    }

    /// Number of commands still waiting for a response. Exposed for
    /// diagnostics; steady state is zero.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // ── Request / Response ──────────────────────────────────────

    /// Sends one command and awaits its response. The pending entry is
    /// removed on every exit path: delivered, send failure, or timeout.
    /// A response carrying `success=false` surfaces as an agent
    /// rejection with the agent-supplied reason.
    pub async fn send_to_node(
        &self,
        node_id: u32,
        command: AgentCommand,
        timeout: Duration,
    ) -> Result<AgentReport> {
        let session = self
            .sessions
            .get(&node_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or(FabricError::AgentNotConnected(node_id))?;

        let request_id = command.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        if let Err(e) = session.send_command(&command).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(report)) => {
                let response = report.response_data();
                if !response.success {
                    return Err(FabricError::AgentRejection(response.message));
                }
                Ok(report)
            }
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                Err(FabricError::SessionClosed)
            }
            Err(_) => {
                self.pending.remove(&request_id);
                Err(FabricError::CommandTimeout {
                    node_id,
                    request_id,
                })
            }
        }
    }

    // ── Inbound Dispatch ────────────────────────────────────────

    /// Decrypts and dispatches one inbound frame. Malformed frames are
    /// logged and dropped; only socket errors end a session.
    pub async fn handle_frame(&self, session: &AgentSession, frame: &str) {
        let plaintext = match session.open_frame(frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(node = session.node_id, error = %e, "undecryptable frame");
                return;
            }
        };
        let report: AgentReport = match serde_json::from_slice(&plaintext) {
            Ok(r) => r,
            Err(e) => {
                warn!(node = session.node_id, error = %e, "malformed report");
                return;
            }
        };
        self.handle_report(session, report);
    }

    fn handle_report(&self, session: &AgentSession, mut report: AgentReport) {
        // Stamped on ingress; agents do not know their own node id.
        report.node_id = session.node_id;

        match report.report_type {
            ReportType::Heartbeat => {
                debug!(node = session.node_id, "heartbeat");
                self.store.record_heartbeat(session.node_id);
            }
            ReportType::Response => {
                // Non-blocking hand-off: when nobody is waiting the
                // caller has already timed out and the report is dropped.
                if let Some((_, tx)) = self.pending.remove(&report.id) {
                    let _ = tx.send(report);
                }
            }
            ReportType::Traffic => {
                // Extension point: credited to rule/tunnel counters.
                debug!(node = session.node_id, data = %report.data, "traffic report");
            }
            ReportType::Error => {
                error!(node = session.node_id, data = %report.data, "agent error report");
            }
        }
    }
}
