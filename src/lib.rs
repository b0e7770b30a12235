//! # Spruce Core
//!
//! The session layer of the Spruce messenger: hybrid post-quantum session
//! establishment and message confidentiality between two users.
//!
//! ## Features
//!
//! - **Hybrid Handshake**: X25519 ephemeral agreement combined with ML-KEM-768
//!   encapsulation, authenticated by ML-DSA-65 (or Ed25519) signatures
//! - **Session Keys**: HKDF-SHA256 over both shared secrets, persisted as
//!   components and re-derived on restart
//! - **Message Encryption**: AES-256-GCM or ChaCha20-Poly1305 with fresh nonces
//! - **Retry Queue**: Undecryptable messages are kept for bounded retries
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spruce_core::{InMemoryRelay, MemoryStore, SessionManager, SpruceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SpruceConfig::default();
//!     let relay = Arc::new(InMemoryRelay::new());
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let bundle = SessionManager::register("alice", &config, relay.as_ref(), store.clone()).await?;
//!     println!("registered {}", bundle.username);
//!
//!     let (manager, _events) = SessionManager::init(config, relay, store).await?;
//!     manager.connect("bob").await?;
//!     manager.send("bob", "hello").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: Key agreement, KEM and signature primitives plus identity keys
//! - [`session`]: Handshake protocol, session key store, secure channel, retry queue
//! - [`transport`]: Wire packets and the relay abstraction
//! - [`storage`]: Key-value persistence
//! - [`utils`]: Configuration, error handling and encoding helpers

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod session;
pub mod storage;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{PollSummary, SessionEvent, SessionManager};
pub use crypto::{IdentityKeyPair, KeyMaterialManager, PublicKeyBundle, SignatureAlgorithm};
pub use session::{
    CipherSuite, HandshakeProtocol, HandshakeState, RetryQueue, SecureChannel, SessionKey,
    SessionKeyStore,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{HandshakePacket, InMemoryRelay, MessagePacket, Transport};
pub use utils::{Result, SpruceConfig, SpruceError};

/// Default configuration values
pub mod defaults {
    /// Default idle timeout in seconds (30 minutes)
    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

    /// Default maximum handshake age in seconds
    pub const DEFAULT_HANDSHAKE_MAX_AGE_SECS: u64 = 300;

    /// Handshakes stamped further than this in the future are rejected
    pub const MAX_CLOCK_SKEW_SECS: u64 = 60;

    /// Default retry cap for failed messages
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Default poll interval in milliseconds
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
}
