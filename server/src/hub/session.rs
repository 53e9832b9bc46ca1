//! # Agent Session
//!
//! One live, encrypted WebSocket session per connected node. The session
//! owns the write half behind a mutex so concurrent senders serialize;
//! the read half is driven by the per-connection reader task in
//! [`crate::handlers`].

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::Mutex;

use fabric_protocol::AgentCommand;

use super::crypto::FrameCipher;
use crate::error::{FabricError, Result};
use crate::models::Node;

pub struct AgentSession {
    pub node_id: u32,
    pub node_name: String,
    cipher: FrameCipher,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl AgentSession {
    pub fn new(node: &Node, sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            node_id: node.id,
            node_name: node.name.clone(),
            cipher: FrameCipher::new(&node.secret),
            sink: Mutex::new(sink),
        }
    }

    /// Seals and sends one plaintext as an encrypted text frame.
    pub async fn send_plaintext(&self, plaintext: &[u8]) -> Result<()> {
        let frame = self.cipher.seal(plaintext)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(frame.into()))
            .await
            .map_err(|_| FabricError::SessionClosed)
    }

    pub async fn send_command(&self, command: &AgentCommand) -> Result<()> {
        let plaintext = serde_json::to_vec(command)?;
        self.send_plaintext(&plaintext).await
    }

    /// Decrypts one inbound frame.
    pub fn open_frame(&self, frame: &str) -> Result<Vec<u8>> {
        self.cipher.open(frame)
    }

    pub async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}
