//! # Tunnel Compiler & Deployer
//!
//! Translates a declarative tunnel (chain hops + forwards) into an
//! ordered plan of per-node agent commands and issues it through the
//! hub. The deployer never aborts mid-plan: every command is attempted
//! and failures are collected, so a partially reachable fabric converges
//! as far as it can. Re-deploying is safe because service and chain
//! names are a pure function of `(tunnel, forward[, chain hop])` and the
//! agent treats add-operations as upserts.
//!
//! Chains compile exit-first: each hop's forwarder points at the
//! previously emitted hop's listening address, so the rolling address
//! starts at the exit and walks the relays in reverse sort order before
//! the entry's chain descriptor is produced.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use fabric_protocol::{
    AgentCommand, ChainConfig, ChainHop, ChainNode, ForwarderNode, ForwarderSpec, ServiceConfig,
};

use crate::error::{FabricError, Result};
use crate::forwarder::join_host_port;
use crate::hub::{AgentHub, DEFAULT_COMMAND_TIMEOUT};
use crate::models::{ChainRole, ChainTunnel, Forward, Node, Tunnel, TunnelType};
use crate::store::Store;
use crate::syslog::SystemLogger;

const MODULE: &str = "deployer";

/// One command addressed to one node, in issue order.
#[derive(Debug, Clone)]
pub struct PlannedCommand {
    pub node_id: u32,
    pub command: AgentCommand,
}

/// Compilation output: the ordered command plan plus the structural
/// errors found along the way (a bad forward is skipped, not fatal).
#[derive(Debug, Default)]
pub struct CompilePlan {
    pub commands: Vec<PlannedCommand>,
    pub errors: Vec<String>,
}

impl CompilePlan {
    fn push(&mut self, node_id: u32, command: AgentCommand) {
        self.commands.push(PlannedCommand { node_id, command });
    }
}

/// Result of issuing a plan: how many commands went out and every error
/// encountered. Partial deploys are preserved; there is no rollback.
#[derive(Debug, Default)]
pub struct DeployOutcome {
    pub issued: usize,
    pub errors: Vec<String>,
}

impl DeployOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct TunnelDeployer {
    store: Arc<dyn Store>,
    hub: Arc<AgentHub>,
    logger: SystemLogger,
    command_timeout: Duration,
}

impl TunnelDeployer {
    pub fn new(store: Arc<dyn Store>, hub: Arc<AgentHub>, logger: SystemLogger) -> Self {
        Self {
            store,
            hub,
            logger,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Compiles and issues the full plan for a tunnel. The only hard
    /// error is an unknown tunnel id; everything else is aggregated.
    pub async fn deploy_tunnel(&self, tunnel_id: u32) -> Result<DeployOutcome> {
        let tunnel = self
            .store
            .tunnel(tunnel_id)
            .ok_or(FabricError::TunnelNotFound(tunnel_id))?;

        let plan = compile_tunnel(&tunnel);
        let mut outcome = self.issue(plan.commands).await;
        let mut errors = plan.errors;
        errors.append(&mut outcome.errors);
        outcome.errors = errors;

        self.log_outcome("deploy", &tunnel, &outcome);
        Ok(outcome)
    }

    /// Sends the delete sweep for every `(chain hop, forward)` pair of
    /// the tunnel. Agents treat deletion of a missing service as
    /// success, so undeploy is idempotent.
    pub async fn undeploy_tunnel(&self, tunnel_id: u32) -> Result<DeployOutcome> {
        let tunnel = self
            .store
            .tunnel(tunnel_id)
            .ok_or(FabricError::TunnelNotFound(tunnel_id))?;

        let plan = compile_undeploy(&tunnel);
        let mut outcome = self.issue(plan.commands).await;
        let mut errors = plan.errors;
        errors.append(&mut outcome.errors);
        outcome.errors = errors;

        self.log_outcome("undeploy", &tunnel, &outcome);
        Ok(outcome)
    }

    async fn issue(&self, commands: Vec<PlannedCommand>) -> DeployOutcome {
        let mut outcome = DeployOutcome::default();
        for planned in commands {
            outcome.issued += 1;
            if let Err(e) = self
                .hub
                .send_to_node(planned.node_id, planned.command, self.command_timeout)
                .await
            {
                warn!(node = planned.node_id, error = %e, "command failed");
                outcome.errors.push(format!("node {}: {}", planned.node_id, e));
            }
        }
        outcome
    }

    fn log_outcome(&self, action: &str, tunnel: &Tunnel, outcome: &DeployOutcome) {
        if outcome.is_success() {
            info!(tunnel = tunnel.id, issued = outcome.issued, "{action} complete");
            self.logger.write(
                "info",
                MODULE,
                format!("{action} tunnel {}: {} commands", tunnel.id, outcome.issued),
            );
        } else {
            self.logger.error(
                MODULE,
                format!(
                    "{action} tunnel {}: {} of {} commands failed: {}",
                    tunnel.id,
                    outcome.errors.len(),
                    outcome.issued,
                    outcome.errors.join("; ")
                ),
            );
        }
    }
}

// ─── Compilation ────────────────────────────────────────────────

/// Compiles one tunnel into its full command plan, forward by forward.
pub fn compile_tunnel(tunnel: &Tunnel) -> CompilePlan {
    let mut plan = CompilePlan::default();
    for fwd in &tunnel.forwards {
        match tunnel.tunnel_type {
            TunnelType::PortForward => compile_port_forward(tunnel, fwd, &mut plan),
            TunnelType::ChainRelay => compile_chain_relay(tunnel, fwd, &mut plan),
        }
    }
    plan
}

/// Compiles the undeploy sweep: `delete_service` for every name pattern
/// a deploy could have produced, on every chain node.
pub fn compile_undeploy(tunnel: &Tunnel) -> CompilePlan {
    let mut plan = CompilePlan::default();
    for chain in &tunnel.chain_tunnels {
        let Some(node) = &chain.node else {
            plan.errors.push(format!(
                "tunnel {}: chain hop {}: node {} not found",
                tunnel.id, chain.id, chain.node_id
            ));
            continue;
        };
        for fwd in &tunnel.forwards {
            for name in [
                format!("fwd_{}_{}", tunnel.id, fwd.id),
                format!("chain_{}_{}_entry", tunnel.id, fwd.id),
                format!("chain_{}_{}_exit", tunnel.id, fwd.id),
                format!("chain_{}_{}_relay_{}", tunnel.id, fwd.id, chain.id),
            ] {
                plan.push(node.id, AgentCommand::delete_service(&name));
            }
        }
    }
    plan
}

fn chain_node<'a>(
    tunnel: &Tunnel,
    chain: &'a ChainTunnel,
    plan: &mut CompilePlan,
) -> Option<&'a Node> {
    if chain.node.is_none() {
        plan.errors.push(format!(
            "tunnel {}: chain hop {}: node {} not found",
            tunnel.id, chain.id, chain.node_id
        ));
    }
    chain.node.as_ref()
}

fn find_role<'a>(tunnel: &'a Tunnel, role: ChainRole) -> Option<&'a ChainTunnel> {
    tunnel
        .chain_tunnels
        .iter()
        .filter(|c| c.chain_type == role)
        .min_by_key(|c| c.sort_index)
}

fn relays_sorted(tunnel: &Tunnel) -> Vec<&ChainTunnel> {
    let mut relays: Vec<&ChainTunnel> = tunnel
        .chain_tunnels
        .iter()
        .filter(|c| c.chain_type == ChainRole::Relay)
        .collect();
    relays.sort_by_key(|c| c.sort_index);
    relays
}

fn target_spec(service_name: &str, addr: &str) -> ForwarderSpec {
    ForwarderSpec {
        nodes: vec![ForwarderNode {
            name: format!("{service_name}_target"),
            addr: addr.to_string(),
        }],
    }
}

/// PortForward: one plain TCP service on the entry node per forward.
fn compile_port_forward(tunnel: &Tunnel, fwd: &Forward, plan: &mut CompilePlan) {
    let Some(entry) = find_role(tunnel, ChainRole::Entry) else {
        plan.errors.push(format!(
            "tunnel {}: forward {}: no entry node",
            tunnel.id, fwd.id
        ));
        return;
    };
    let Some(node) = chain_node(tunnel, entry, plan) else {
        return;
    };

    let name = format!("fwd_{}_{}", tunnel.id, fwd.id);
    let service = ServiceConfig {
        name: name.clone(),
        addr: format!(":{}", fwd.listen_port),
        handler: "tcp".into(),
        listener: "tcp".into(),
        forwarder: Some(target_spec(&name, &fwd.remote_address)),
        chain: None,
    };
    plan.push(node.id, AgentCommand::add_service(&service));
}

/// ChainRelay: exit service, relay services in reverse sort order, then
/// the entry's chain descriptor and listener service.
fn compile_chain_relay(tunnel: &Tunnel, fwd: &Forward, plan: &mut CompilePlan) {
    let Some(entry) = find_role(tunnel, ChainRole::Entry) else {
        plan.errors.push(format!(
            "tunnel {}: forward {}: no entry node",
            tunnel.id, fwd.id
        ));
        return;
    };
    let Some(exit) = find_role(tunnel, ChainRole::Exit) else {
        plan.errors.push(format!(
            "tunnel {}: forward {}: no exit node",
            tunnel.id, fwd.id
        ));
        return;
    };
    let (Some(entry_node), Some(exit_node)) = (
        chain_node(tunnel, entry, plan),
        chain_node(tunnel, exit, plan),
    ) else {
        return;
    };

    // Exit: terminates the chain and forwards to the user's target.
    let exit_name = format!("chain_{}_{}_exit", tunnel.id, fwd.id);
    let exit_service = ServiceConfig {
        name: exit_name.clone(),
        addr: format!(":{}", exit.port),
        handler: "relay".into(),
        listener: exit.protocol.transport_tag().into(),
        forwarder: Some(target_spec(&exit_name, &fwd.remote_address)),
        chain: None,
    };
    plan.push(exit_node.id, AgentCommand::add_service(&exit_service));

    // Relays, walked backwards so each forwarder points at the hop that
    // was just emitted.
    let mut prev_addr = join_host_port(&exit_node.host, exit.port);
    for relay in relays_sorted(tunnel).into_iter().rev() {
        let Some(relay_node) = chain_node(tunnel, relay, plan) else {
            continue;
        };
        let relay_name = format!("chain_{}_{}_relay_{}", tunnel.id, fwd.id, relay.id);
        let relay_service = ServiceConfig {
            name: relay_name.clone(),
            addr: format!(":{}", relay.port),
            handler: "relay".into(),
            listener: relay.protocol.transport_tag().into(),
            forwarder: Some(target_spec(&relay_name, &prev_addr)),
            chain: None,
        };
        plan.push(relay_node.id, AgentCommand::add_service(&relay_service));
        prev_addr = join_host_port(&relay_node.host, relay.port);
    }

    // Entry: a chain descriptor dialing the first hop, and a plain TCP
    // listener that routes through it.
    let chain_name = format!("chain_{}_{}", tunnel.id, fwd.id);
    let chain = ChainConfig {
        name: chain_name.clone(),
        hops: vec![ChainHop {
            name: format!("{chain_name}_hop"),
            nodes: vec![ChainNode {
                name: format!("{chain_name}_node"),
                addr: prev_addr,
                connector: "relay".into(),
                dialer: entry.protocol.transport_tag().into(),
            }],
        }],
    };
    plan.push(entry_node.id, AgentCommand::add_chain(&chain));

    let entry_service = ServiceConfig {
        name: format!("chain_{}_{}_entry", tunnel.id, fwd.id),
        addr: format!(":{}", fwd.listen_port),
        handler: "tcp".into(),
        listener: "tcp".into(),
        forwarder: None,
        chain: Some(chain_name),
    };
    plan.push(entry_node.id, AgentCommand::add_service(&entry_service));
}
