//! # Server State
//!
//! Holds the constructed core components and hands clones to each
//! request handler. Everything shares the same store handle; no
//! process-wide singletons.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::checker::NodeChecker;
use crate::collector::TrafficCollector;
use crate::deploy::TunnelDeployer;
use crate::hub::AgentHub;
use crate::manager::ForwardManager;
use crate::store::Store;
use crate::syslog::SystemLogger;

/// Shared application state, cloned and passed to each request handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hub: Arc<AgentHub>,
    pub manager: Arc<ForwardManager>,
    pub collector: Arc<TrafficCollector>,
    pub deployer: Arc<TunnelDeployer>,
    pub checker: Arc<NodeChecker>,
    pub logger: SystemLogger,
    /// Externally reachable address of this controller, embedded into
    /// install commands and the bootstrap script.
    pub panel_addr: String,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, panel_addr: impl Into<String>) -> Self {
        let logger = SystemLogger::new(store.clone());
        let hub = Arc::new(AgentHub::new(store.clone()));
        let manager = Arc::new(ForwardManager::new(store.clone()));
        let collector = Arc::new(TrafficCollector::new(manager.clone(), store.clone()));
        let deployer = Arc::new(TunnelDeployer::new(
            store.clone(),
            hub.clone(),
            logger.clone(),
        ));
        let checker = Arc::new(NodeChecker::new(store.clone(), logger.clone()));

        Self {
            store,
            hub,
            manager,
            collector,
            deployer,
            checker,
            logger,
            panel_addr: panel_addr.into(),
        }
    }

    /// Spawns the periodic loops: stats persistence, telemetry
    /// collection, and the node reachability sweep. All of them stop
    /// with the token.
    pub fn spawn_background(&self, cancel: &CancellationToken) {
        self.manager.spawn_persist_loop(cancel.clone());
        self.collector.spawn(cancel.clone());
        self.checker.clone().spawn(cancel.clone());
    }
}
