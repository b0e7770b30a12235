//! Algorithm-agnostic interfaces for the handshake's asymmetric primitives.
//!
//! The handshake only sees byte strings. Concrete algorithms live in
//! [`crate::crypto::pq`] and can be swapped for tests.

use crate::utils::Result;
use zeroize::Zeroizing;

/// Heap bytes wiped on drop
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// Encoded key pair produced by a primitive
pub struct KeyPairBytes {
    /// Encoded private half
    pub private_key: SecretBytes,
    /// Encoded public half
    pub public_key: Vec<u8>,
}

impl std::fmt::Debug for KeyPairBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairBytes")
            .field("private_key", &"<redacted>")
            .field("public_key_len", &self.public_key.len())
            .finish()
    }
}

/// A key encapsulation mechanism
pub trait KeyEncapsulationMechanism: Send + Sync {
    /// Algorithm name recorded alongside persisted keys
    fn algorithm(&self) -> &'static str;

    /// Generate a fresh key pair
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` if the RNG or encoder fails
    fn generate_keypair(&self) -> Result<KeyPairBytes>;

    /// Encapsulate a fresh shared secret to `public_key`
    ///
    /// Returns the ciphertext and the shared secret.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::EncapsulationFailure` if the key is malformed
    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SecretBytes)>;

    /// Recover the shared secret from `ciphertext`
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::DecapsulationFailure` if either input is malformed
    fn decapsulate(&self, private_key: &[u8], ciphertext: &[u8]) -> Result<SecretBytes>;
}

/// A detached signature scheme
pub trait SignatureScheme: Send + Sync {
    /// Algorithm name recorded alongside persisted keys
    fn algorithm(&self) -> &'static str;

    /// Generate a fresh key pair
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` if the RNG or encoder fails
    fn generate_keypair(&self) -> Result<KeyPairBytes>;

    /// Sign `message`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` or `CryptoError::Signing`
    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>>;

    /// Verify `signature` over `message`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SignatureVerification` on any mismatch,
    /// including a malformed key or signature
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()>;
}
