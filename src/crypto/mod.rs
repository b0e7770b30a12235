//! Cryptographic primitives and identity management.
//!
//! Provides X25519 agreement, the KEM and signature abstractions with their
//! ML-KEM-768, ML-DSA-65 and Ed25519 implementations, and the identity key
//! material that ties them together.

pub mod dh;
pub mod identity;
pub mod pq;
pub mod primitives;

pub use identity::*;
pub use pq::{Ed25519, MlDsa65, MlKem768, SignatureAlgorithm};
pub use primitives::{KeyEncapsulationMechanism, KeyPairBytes, SecretBytes, SignatureScheme};
