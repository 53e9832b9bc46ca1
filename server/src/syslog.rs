//! # System Log Writer
//!
//! Operational events that operators should see in the panel (node
//! flips, deploy outcomes) are appended to the store's system log and
//! mirrored onto the process log.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::models::SystemLog;
use crate::store::Store;

#[derive(Clone)]
pub struct SystemLogger {
    store: Arc<dyn Store>,
}

impl SystemLogger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn write(&self, level: &str, module: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            "error" => error!(module, "{message}"),
            "warn" => warn!(module, "{message}"),
            _ => info!(module, "{message}"),
        }
        self.store.append_system_log(SystemLog {
            id: 0,
            level: level.to_string(),
            module: module.to_string(),
            message,
            created_at: Utc::now(),
        });
    }

    pub fn warn(&self, module: &str, message: impl Into<String>) {
        self.write("warn", module, message);
    }

    pub fn error(&self, module: &str, message: impl Into<String>) {
        self.write("error", module, message);
    }
}
