//! Concrete KEM and signature implementations.
//!
//! ML-KEM-768 (FIPS 203) backs the post-quantum half of the handshake.
//! Handshake transcripts are signed with ML-DSA-65 (FIPS 204) by default;
//! Ed25519 is available for deployments that need compact signatures.

use crate::crypto::primitives::{
    KeyEncapsulationMechanism, KeyPairBytes, SecretBytes, SignatureScheme,
};
use crate::utils::{CryptoError, HandshakeError, Result};
use ml_dsa::signature::{Signer as _, Verifier as _};
use ml_dsa::KeyGen as _;
use ml_kem::kem::{Decapsulate as _, DecapsulationKey, Encapsulate as _, EncapsulationKey};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem768Params};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

type KemEk = EncapsulationKey<MlKem768Params>;
type KemDk = DecapsulationKey<MlKem768Params>;

/// ML-KEM-768 key encapsulation
#[derive(Debug, Clone, Copy, Default)]
pub struct MlKem768;

impl MlKem768 {
    fn encapsulation_key(public_key: &[u8]) -> std::result::Result<KemEk, HandshakeError> {
        let encoded =
            Encoded::<KemEk>::try_from(public_key).map_err(|_| {
                HandshakeError::EncapsulationFailure {
                    reason: format!("invalid ML-KEM-768 public key length {}", public_key.len()),
                }
            })?;
        Ok(KemEk::from_bytes(&encoded))
    }

    fn decapsulation_key(private_key: &[u8]) -> std::result::Result<KemDk, HandshakeError> {
        let encoded =
            Encoded::<KemDk>::try_from(private_key).map_err(|_| {
                HandshakeError::DecapsulationFailure {
                    reason: format!("invalid ML-KEM-768 private key length {}", private_key.len()),
                }
            })?;
        Ok(KemDk::from_bytes(&encoded))
    }
}

impl KeyEncapsulationMechanism for MlKem768 {
    fn algorithm(&self) -> &'static str {
        "ML-KEM-768"
    }

    fn generate_keypair(&self) -> Result<KeyPairBytes> {
        let (dk, ek) = ml_kem::MlKem768::generate(&mut OsRng);
        Ok(KeyPairBytes {
            private_key: Zeroizing::new(dk.as_bytes().as_slice().to_vec()),
            public_key: ek.as_bytes().as_slice().to_vec(),
        })
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SecretBytes)> {
        let ek = Self::encapsulation_key(public_key)?;
        let (ct, ss) = ek
            .encapsulate(&mut OsRng)
            .map_err(|_| HandshakeError::EncapsulationFailure {
                reason: "ML-KEM-768 encapsulation failed".to_string(),
            })?;

        let ct_bytes: &[u8] = ct.as_ref();
        Ok((ct_bytes.to_vec(), Zeroizing::new(ss.as_slice().to_vec())))
    }

    fn decapsulate(&self, private_key: &[u8], ciphertext: &[u8]) -> Result<SecretBytes> {
        let dk = Self::decapsulation_key(private_key)?;
        let ct = ml_kem::Ciphertext::<ml_kem::MlKem768>::try_from(ciphertext).map_err(|_| {
            HandshakeError::DecapsulationFailure {
                reason: format!("invalid ML-KEM-768 ciphertext length {}", ciphertext.len()),
            }
        })?;
        let ss = dk
            .decapsulate(&ct)
            .map_err(|_| HandshakeError::DecapsulationFailure {
                reason: "ML-KEM-768 decapsulation failed".to_string(),
            })?;

        Ok(Zeroizing::new(ss.as_slice().to_vec()))
    }
}

/// ML-DSA-65 signatures
#[derive(Debug, Clone, Copy, Default)]
pub struct MlDsa65;

impl SignatureScheme for MlDsa65 {
    fn algorithm(&self) -> &'static str {
        "ML-DSA-65"
    }

    fn generate_keypair(&self) -> Result<KeyPairBytes> {
        let kp = ml_dsa::MlDsa65::key_gen(&mut OsRng);
        Ok(KeyPairBytes {
            private_key: Zeroizing::new(kp.signing_key().encode().as_slice().to_vec()),
            public_key: kp.verifying_key().encode().as_slice().to_vec(),
        })
    }

    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        let encoded = ml_dsa::EncodedSigningKey::<ml_dsa::MlDsa65>::try_from(private_key)
            .map_err(|_| CryptoError::InvalidKey {
                reason: format!("invalid ML-DSA-65 signing key length {}", private_key.len()),
            })?;
        let sk = ml_dsa::SigningKey::<ml_dsa::MlDsa65>::decode(&encoded);
        let signature = sk.try_sign(message).map_err(|e| CryptoError::Signing {
            reason: e.to_string(),
        })?;
        Ok(signature.encode().as_slice().to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
        let encoded = ml_dsa::EncodedVerifyingKey::<ml_dsa::MlDsa65>::try_from(public_key)
            .map_err(|_| CryptoError::SignatureVerification)?;
        let vk = ml_dsa::VerifyingKey::<ml_dsa::MlDsa65>::decode(&encoded);
        let signature = ml_dsa::Signature::<ml_dsa::MlDsa65>::try_from(signature)
            .map_err(|_| CryptoError::SignatureVerification)?;

        vk.verify(message, &signature)
            .map_err(|_| CryptoError::SignatureVerification.into())
    }
}

/// Ed25519 signatures over a 32-byte seed
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519;

impl SignatureScheme for Ed25519 {
    fn algorithm(&self) -> &'static str {
        "Ed25519"
    }

    fn generate_keypair(&self) -> Result<KeyPairBytes> {
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        Ok(KeyPairBytes {
            private_key: Zeroizing::new(signing_key.to_bytes().to_vec()),
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
        })
    }

    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        let seed: Zeroizing<[u8; ed25519_dalek::SECRET_KEY_LENGTH]> =
            Zeroizing::new(private_key.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!("Ed25519 seed must be 32 bytes, got {}", private_key.len()),
            })?);
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&seed);
        Ok(ed25519_dalek::Signer::sign(&signing_key, message)
            .to_bytes()
            .to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
        let public: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = public_key
            .try_into()
            .map_err(|_| CryptoError::SignatureVerification)?;
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&public)
            .map_err(|_| CryptoError::SignatureVerification)?;
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| CryptoError::SignatureVerification)?;

        verifying_key
            .verify_strict(message, &signature)
            .map_err(|_| CryptoError::SignatureVerification.into())
    }
}

/// Signature algorithm used to authenticate handshakes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// ML-DSA-65 (FIPS 204)
    #[serde(rename = "ml-dsa-65")]
    MlDsa65,
    /// Ed25519
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl SignatureAlgorithm {
    /// Instantiate the scheme
    pub fn scheme(self) -> Arc<dyn SignatureScheme> {
        match self {
            Self::MlDsa65 => Arc::new(MlDsa65),
            Self::Ed25519 => Arc::new(Ed25519),
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MlDsa65 => write!(f, "ml-dsa-65"),
            Self::Ed25519 => write!(f, "ed25519"),
        }
    }
}
