//! X25519 key agreement.
//!
//! Identity DH keys are static; the initiator's handshake key is an
//! [`EphemeralDh`] that is consumed by its single agreement.

use crate::crypto::primitives::{KeyPairBytes, SecretBytes};
use crate::utils::{CryptoError, Result};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length of X25519 public keys, private keys and shared secrets
pub const DH_KEY_LEN: usize = 32;

/// Generate a static X25519 key pair for an identity
pub fn generate_keypair() -> KeyPairBytes {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    KeyPairBytes {
        private_key: Zeroizing::new(secret.to_bytes().to_vec()),
        public_key: public.as_bytes().to_vec(),
    }
}

/// Agree on a shared secret between a static private key and a peer public key
///
/// # Errors
///
/// Returns `CryptoError::InvalidKey` for wrongly sized keys and
/// `CryptoError::KeyAgreement` if the result is all zeros
pub fn agree(private_key: &[u8], public_key: &[u8]) -> Result<SecretBytes> {
    let private: Zeroizing<[u8; DH_KEY_LEN]> =
        Zeroizing::new(private_key.try_into().map_err(|_| CryptoError::InvalidKey {
            reason: format!(
                "X25519 private key must be {} bytes, got {}",
                DH_KEY_LEN,
                private_key.len()
            ),
        })?);

    let secret = StaticSecret::from(*private);
    let shared = secret.diffie_hellman(&parse_public(public_key)?);
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreement {
            reason: "peer public key is a low-order point".to_string(),
        }
        .into());
    }

    Ok(Zeroizing::new(shared.as_bytes().to_vec()))
}

/// Single-use X25519 key pair for the initiating side of a handshake
pub struct EphemeralDh {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralDh {
    /// Generate a fresh ephemeral key pair
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half, sent to the peer in the handshake
    pub fn public_key_bytes(&self) -> [u8; DH_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Agree with the peer's static public key, consuming the private half
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` or `CryptoError::KeyAgreement`
    pub fn agree(self, peer_public_key: &[u8]) -> Result<SecretBytes> {
        let shared = self.secret.diffie_hellman(&parse_public(peer_public_key)?);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreement {
                reason: "peer public key is a low-order point".to_string(),
            }
            .into());
        }
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }
}

impl std::fmt::Debug for EphemeralDh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralDh")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

fn parse_public(bytes: &[u8]) -> Result<PublicKey> {
    let array: [u8; DH_KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
        reason: format!(
            "X25519 public key must be {} bytes, got {}",
            DH_KEY_LEN,
            bytes.len()
        ),
    })?;
    Ok(PublicKey::from(array))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_agreement_is_symmetric() {
        let alice = generate_keypair();
        let bob = generate_keypair();

        let ab = agree(&alice.private_key, &bob.public_key).unwrap();
        let ba = agree(&bob.private_key, &alice.public_key).unwrap();
        assert_eq!(*ab, *ba);
        assert_eq!(ab.len(), DH_KEY_LEN);
    }

    #[test]
    fn test_ephemeral_matches_static_side() {
        let bob = generate_keypair();
        let ephemeral = EphemeralDh::generate();
        let ephemeral_public = ephemeral.public_key_bytes();

        let initiator = ephemeral.agree(&bob.public_key).unwrap();
        let responder = agree(&bob.private_key, &ephemeral_public).unwrap();
        assert_eq!(*initiator, *responder);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let bob = generate_keypair();
        assert!(agree(&bob.private_key, &[1u8; 31]).is_err());
        assert!(agree(&[7u8; 16], &bob.public_key).is_err());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let bob = generate_keypair();
        let result = agree(&bob.private_key, &[0u8; DH_KEY_LEN]);
        assert!(matches!(
            result,
            Err(crate::utils::SpruceError::Crypto(CryptoError::KeyAgreement { .. }))
        ));
    }
}
