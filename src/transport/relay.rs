//! The relay collaborator: key directory plus store-and-forward queues.
//!
//! [`Transport`] is what the session layer needs from the relay server.
//! [`InMemoryRelay`] implements it in-process for tests, demos and local use.

use crate::crypto::PublicKeyBundle;
use crate::transport::protocol::{HandshakePacket, MessagePacket};
use crate::utils::TransportError;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Relay operations used by the session layer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a user's public keys
    async fn publish_keys(&self, bundle: PublicKeyBundle) -> TransportResult<()>;

    /// Fetch a user's public keys
    async fn get_public_keys(&self, username: &str) -> TransportResult<PublicKeyBundle>;

    /// Whether a user is registered
    async fn verify_user(&self, username: &str) -> TransportResult<bool>;

    /// Queue a handshake for its recipient
    async fn send_handshake(&self, packet: HandshakePacket) -> TransportResult<()>;

    /// Take all handshakes queued for `username`
    async fn receive_handshakes(&self, username: &str) -> TransportResult<Vec<HandshakePacket>>;

    /// Queue a message for its recipient
    async fn send_message(&self, packet: MessagePacket) -> TransportResult<()>;

    /// Messages queued for `username`; they stay queued until cleared
    async fn receive_messages(&self, username: &str) -> TransportResult<Vec<MessagePacket>>;

    /// Drop all messages queued for `username`
    async fn clear_messages(&self, username: &str) -> TransportResult<()>;
}

#[derive(Debug, Default)]
struct RelayState {
    users: HashMap<String, PublicKeyBundle>,
    handshakes: HashMap<String, Vec<HandshakePacket>>,
    messages: HashMap<String, Vec<MessagePacket>>,
}

/// In-process relay
#[derive(Debug)]
pub struct InMemoryRelay {
    state: Mutex<RelayState>,
    reachable: AtomicBool,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelay {
    /// Create an empty, reachable relay
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulate the relay going down or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of messages waiting for `username`
    pub async fn pending_messages(&self, username: &str) -> usize {
        self.state
            .lock()
            .await
            .messages
            .get(username)
            .map_or(0, Vec::len)
    }

    /// Apply `f` to every message queued for `username`
    pub async fn tamper_messages<F>(&self, username: &str, mut f: F)
    where
        F: FnMut(&mut MessagePacket) + Send,
    {
        if let Some(queue) = self.state.lock().await.messages.get_mut(username) {
            queue.iter_mut().for_each(|packet| f(packet));
        }
    }

    /// Apply `f` to every handshake queued for `username`
    pub async fn tamper_handshakes<F>(&self, username: &str, mut f: F)
    where
        F: FnMut(&mut HandshakePacket) + Send,
    {
        if let Some(queue) = self.state.lock().await.handshakes.get_mut(username) {
            queue.iter_mut().for_each(|packet| f(packet));
        }
    }

    fn ensure_reachable(&self) -> TransportResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unreachable {
                reason: "relay offline".to_string(),
            })
        }
    }
}

#[async_trait]
impl Transport for InMemoryRelay {
    async fn publish_keys(&self, bundle: PublicKeyBundle) -> TransportResult<()> {
        self.ensure_reachable()?;
        if bundle.username.trim().is_empty() {
            return Err(TransportError::Rejected {
                reason: "username must not be empty".to_string(),
            });
        }
        debug!("Relay registered {}", bundle.username);
        self.state
            .lock()
            .await
            .users
            .insert(bundle.username.clone(), bundle);
        Ok(())
    }

    async fn get_public_keys(&self, username: &str) -> TransportResult<PublicKeyBundle> {
        self.ensure_reachable()?;
        self.state
            .lock()
            .await
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| TransportError::UnknownUser {
                username: username.to_string(),
            })
    }

    async fn verify_user(&self, username: &str) -> TransportResult<bool> {
        self.ensure_reachable()?;
        Ok(self.state.lock().await.users.contains_key(username))
    }

    async fn send_handshake(&self, packet: HandshakePacket) -> TransportResult<()> {
        self.ensure_reachable()?;
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&packet.recipient) {
            return Err(TransportError::UnknownUser {
                username: packet.recipient,
            });
        }
        debug!("Relay queued handshake {} -> {}", packet.sender, packet.recipient);
        state
            .handshakes
            .entry(packet.recipient.clone())
            .or_default()
            .push(packet);
        Ok(())
    }

    async fn receive_handshakes(&self, username: &str) -> TransportResult<Vec<HandshakePacket>> {
        self.ensure_reachable()?;
        Ok(self
            .state
            .lock()
            .await
            .handshakes
            .remove(username)
            .unwrap_or_default())
    }

    async fn send_message(&self, packet: MessagePacket) -> TransportResult<()> {
        self.ensure_reachable()?;
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&packet.recipient) {
            return Err(TransportError::UnknownUser {
                username: packet.recipient,
            });
        }
        state
            .messages
            .entry(packet.recipient.clone())
            .or_default()
            .push(packet);
        Ok(())
    }

    async fn receive_messages(&self, username: &str) -> TransportResult<Vec<MessagePacket>> {
        self.ensure_reachable()?;
        Ok(self
            .state
            .lock()
            .await
            .messages
            .get(username)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_messages(&self, username: &str) -> TransportResult<()> {
        self.ensure_reachable()?;
        self.state.lock().await.messages.remove(username);
        Ok(())
    }
}
