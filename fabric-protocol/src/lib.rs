//! # Agent Wire Protocol
//!
//! Message types exchanged between the controller and node agents.
//! Every message travels as an encrypted WebSocket text frame whose
//! plaintext is one JSON object:
//!
//! - [`AgentCommand`] (controller → agent): an action tag, a request id,
//!   and an action-specific payload.
//! - [`AgentReport`] (agent → controller): a report type, the echoed
//!   request id (empty for unsolicited reports), and a type-specific
//!   payload.
//!
//! The payload types ([`ServiceConfig`], [`ChainConfig`], [`DeleteService`])
//! describe units of agent-side forwarding-engine configuration. Agents
//! treat `add_service`/`add_chain` as upserts and deletion of a missing
//! service as success, so re-sending a command is always safe.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Request Ids ────────────────────────────────────────────────

/// Generates a fresh 16-hex-character request id.
///
/// Every command carries one; the matching response echoes it, which is
/// how the hub correlates replies with waiting callers.
pub fn new_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

// ─── Commands (controller → agent) ──────────────────────────────

/// Action tag of an [`AgentCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    /// Install or replace a named service descriptor.
    AddService,
    /// Remove a named service descriptor (missing name is not an error).
    DeleteService,
    /// Install or replace a named chain descriptor.
    AddChain,
    /// Ask the agent for its current status.
    Status,
}

/// One command issued to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommand {
    pub action: CommandAction,
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

impl AgentCommand {
    fn new(action: CommandAction, data: Value) -> Self {
        Self {
            action,
            id: new_request_id(),
            data,
        }
    }

    pub fn add_service(service: &ServiceConfig) -> Self {
        Self::new(
            CommandAction::AddService,
            serde_json::to_value(service).unwrap_or_default(),
        )
    }

    pub fn delete_service(name: &str) -> Self {
        Self::new(
            CommandAction::DeleteService,
            serde_json::to_value(DeleteService {
                name: name.to_string(),
            })
            .unwrap_or_default(),
        )
    }

    pub fn add_chain(chain: &ChainConfig) -> Self {
        Self::new(
            CommandAction::AddChain,
            serde_json::to_value(chain).unwrap_or_default(),
        )
    }

    pub fn status() -> Self {
        Self::new(CommandAction::Status, Value::Null)
    }
}

// ─── Reports (agent → controller) ───────────────────────────────

/// Report type of an [`AgentReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    /// Periodic liveness signal; carries no request id.
    Heartbeat,
    /// Reply to a command; `id` echoes the command's request id.
    Response,
    /// Traffic counters attributed to a service.
    Traffic,
    /// Agent-side failure not tied to a pending command.
    Error,
}

/// One report received from an agent.
///
/// `node_id` is not sent by agents; the controller fills it in on ingress
/// after authenticating the session, so downstream handlers always know
/// which node a report came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    #[serde(rename = "type")]
    pub report_type: ReportType,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub node_id: u32,
    #[serde(default)]
    pub data: Value,
}

impl AgentReport {
    /// Interprets the payload of a `response` report.
    ///
    /// Agents that return a bare acknowledgement (no `success` field)
    /// count as successful.
    pub fn response_data(&self) -> ResponseData {
        serde_json::from_value(self.data.clone()).unwrap_or_default()
    }
}

/// Payload of a `response` report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

fn default_success() -> bool {
    true
}

impl Default for ResponseData {
    fn default() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }
}

// ─── Service Descriptors ────────────────────────────────────────

/// A named unit of agent-side configuration instantiating one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Listen address, usually `:<port>`.
    pub addr: String,
    /// Handler tag (`tcp`, `relay`, ...).
    pub handler: String,
    /// Listener tag (`tcp`, `ws`, `wss`, `mws`, `mwss`).
    pub listener: String,
    /// Upstream target(s) this service forwards to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarder: Option<ForwarderSpec>,
    /// Name of a chain descriptor the handler dials through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderSpec {
    pub nodes: Vec<ForwarderNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderNode {
    pub name: String,
    pub addr: String,
}

/// Payload of a `delete_service` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteService {
    pub name: String,
}

// ─── Chain Descriptors ──────────────────────────────────────────

/// A named multi-hop dialer graph referenced by a service via `chain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub hops: Vec<ChainHop>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHop {
    pub name: String,
    pub nodes: Vec<ChainNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNode {
    pub name: String,
    pub addr: String,
    /// Connector tag (`relay`).
    pub connector: String,
    /// Dialer tag (`tcp`, `ws`, `wss`, `mws`, `mwss`).
    pub dialer: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_16_hex_chars() {
        let id = new_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_request_id());
    }

    #[test]
    fn command_wire_shape() {
        let cmd = AgentCommand::delete_service("fwd_1_2");
        let v: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["action"], "delete_service");
        assert_eq!(v["id"].as_str().unwrap().len(), 16);
        assert_eq!(v["data"]["name"], "fwd_1_2");
    }

    #[test]
    fn service_config_omits_empty_sections() {
        let svc = ServiceConfig {
            name: "chain_1_2_entry".into(),
            addr: ":20000".into(),
            handler: "tcp".into(),
            listener: "tcp".into(),
            forwarder: None,
            chain: Some("chain_1_2".into()),
        };
        let v = serde_json::to_value(&svc).unwrap();
        assert!(v.get("forwarder").is_none());
        assert_eq!(v["chain"], "chain_1_2");
    }

    #[test]
    fn report_round_trip_and_defaults() {
        let raw = r#"{"type":"response","id":"00ff00ff00ff00ff","data":{"success":false,"message":"bind failed"}}"#;
        let report: AgentReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.report_type, ReportType::Response);
        assert_eq!(report.node_id, 0);
        let resp = report.response_data();
        assert!(!resp.success);
        assert_eq!(resp.message, "bind failed");

        // A bare ack counts as success.
        let raw = r#"{"type":"response","id":"00ff00ff00ff00ff"}"#;
        let report: AgentReport = serde_json::from_str(raw).unwrap();
        assert!(report.response_data().success);
    }

    #[test]
    fn heartbeat_needs_no_id() {
        let raw = r#"{"type":"heartbeat"}"#;
        let report: AgentReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.report_type, ReportType::Heartbeat);
        assert!(report.id.is_empty());
    }
}
