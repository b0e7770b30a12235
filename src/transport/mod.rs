//! Transport layer for the session protocol.
//!
//! Wire packet definitions and the relay abstraction through which
//! handshakes and messages travel.

pub mod protocol;
pub mod relay;

pub use protocol::*;
pub use relay::{InMemoryRelay, Transport, TransportResult};
