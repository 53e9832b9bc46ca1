//! # Error Types
//!
//! One error enum for the whole control plane, mapped onto the failure
//! kinds the components distinguish: transient socket I/O, command
//! timeouts (carrying the node id for the operator), agent rejections
//! (carrying the agent-supplied reason), structural tunnel problems, and
//! frame-encryption failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("node {0} has no connected agent")]
    AgentNotConnected(u32),

    #[error("command {request_id} to node {node_id} timed out")]
    CommandTimeout { node_id: u32, request_id: String },

    #[error("agent rejected command: {0}")]
    AgentRejection(String),

    #[error("tunnel {0} not found")]
    TunnelNotFound(u32),

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("rule {0} already started")]
    RuleAlreadyStarted(u32),

    #[error("forwarder already started")]
    ForwarderRunning,

    #[error("crypto: {0}")]
    Crypto(String),

    #[error(transparent)]
    Encoding(#[from] serde_json::Error),

    #[error("agent session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, FabricError>;
