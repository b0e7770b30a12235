//! Session establishment and message protection.
//!
//! The handshake produces two shared secrets, the store turns them into the
//! session key, the channel uses that key for every message, and the retry
//! queue keeps messages the channel could not open.

pub mod channel;
pub mod handshake;
pub mod retry;
pub mod store;

pub use channel::{CipherSuite, Sealed, SecureChannel, NONCE_LEN, TAG_LEN};
pub use handshake::{
    HandshakeMessage, HandshakeProtocol, HandshakeRegistry, HandshakeState, InFlightGuard,
};
pub use retry::{FailedMessageEntry, RetryQueue};
pub use store::{ExpiryGate, SessionKey, SessionKeyComponents, SessionKeyStore};
