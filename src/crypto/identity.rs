//! Long-term identity keys and their persistence.
//!
//! An identity is three key pairs: X25519 for the classical half of the
//! handshake, ML-KEM-768 for the post-quantum half, and a signature key
//! that authenticates handshakes. All three are generated together and
//! persisted as a single record so a partial identity can never be observed.

use crate::crypto::dh;
use crate::crypto::primitives::{KeyEncapsulationMechanism, SecretBytes, SignatureScheme};
use crate::storage::{load_json, save_json, KeyValueStore, IDENTITY_RECORD};
use crate::utils::encoding::{b64, b64_secret};
use crate::utils::{CryptoError, Result, SpruceError};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Public halves of an identity, as published to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyBundle {
    /// Account name the keys belong to
    pub username: String,
    /// X25519 public key
    #[serde(with = "b64", alias = "x25519PublicKey")]
    pub dh_public_key: Vec<u8>,
    /// ML-KEM-768 encapsulation key
    #[serde(with = "b64", alias = "kyberPublicKey")]
    pub kem_public_key: Vec<u8>,
    /// Signature verification key
    #[serde(with = "b64", alias = "dilithiumPublicKey")]
    pub sig_public_key: Vec<u8>,
}

impl PublicKeyBundle {
    /// Short hex fingerprint over all three public keys
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.dh_public_key);
        hasher.update(&self.kem_public_key);
        hasher.update(&self.sig_public_key);
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Full identity key material
///
/// Private halves are wiped on drop and never printed.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKeyPair {
    username: String,
    #[serde(with = "b64", alias = "x25519PublicKey")]
    dh_public_key: Vec<u8>,
    #[serde(with = "b64_secret", alias = "x25519PrivateKey")]
    dh_private_key: SecretBytes,
    #[serde(with = "b64", alias = "kyberPublicKey")]
    kem_public_key: Vec<u8>,
    #[serde(with = "b64_secret", alias = "kyberPrivateKey")]
    kem_private_key: SecretBytes,
    #[serde(with = "b64", alias = "dilithiumPublicKey")]
    sig_public_key: Vec<u8>,
    #[serde(with = "b64_secret", alias = "dilithiumPrivateKey")]
    sig_private_key: SecretBytes,
    kem_algorithm: String,
    sig_algorithm: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl IdentityKeyPair {
    /// Account name
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Public halves suitable for publication
    pub fn public_bundle(&self) -> PublicKeyBundle {
        PublicKeyBundle {
            username: self.username.clone(),
            dh_public_key: self.dh_public_key.clone(),
            kem_public_key: self.kem_public_key.clone(),
            sig_public_key: self.sig_public_key.clone(),
        }
    }

    /// X25519 private key
    pub fn dh_private_key(&self) -> &[u8] {
        &self.dh_private_key
    }

    /// ML-KEM decapsulation key
    pub fn kem_private_key(&self) -> &[u8] {
        &self.kem_private_key
    }

    /// Signing key
    pub fn sig_private_key(&self) -> &[u8] {
        &self.sig_private_key
    }

    /// Signature algorithm the signing key belongs to
    pub fn sig_algorithm(&self) -> &str {
        &self.sig_algorithm
    }

    /// KEM algorithm the decapsulation key belongs to
    pub fn kem_algorithm(&self) -> &str {
        &self.kem_algorithm
    }

    /// When the identity was generated
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    fn ensure_complete(&self) -> Result<()> {
        let halves = [
            ("X25519 public key", self.dh_public_key.as_slice()),
            ("X25519 private key", self.dh_private_key.as_slice()),
            ("KEM public key", self.kem_public_key.as_slice()),
            ("KEM private key", self.kem_private_key.as_slice()),
            ("signature public key", self.sig_public_key.as_slice()),
            ("signature private key", self.sig_private_key.as_slice()),
        ];
        if let Some((name, _)) = halves.iter().find(|(_, bytes)| bytes.is_empty()) {
            return Err(CryptoError::InvalidKey {
                reason: format!("stored identity is missing its {name}"),
            }
            .into());
        }
        if self.dh_public_key.len() != dh::DH_KEY_LEN || self.dh_private_key.len() != dh::DH_KEY_LEN
        {
            return Err(CryptoError::InvalidKey {
                reason: "stored X25519 keys have the wrong length".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("username", &self.username)
            .field("fingerprint", &self.public_bundle().fingerprint())
            .field("kem_algorithm", &self.kem_algorithm)
            .field("sig_algorithm", &self.sig_algorithm)
            .finish_non_exhaustive()
    }
}

/// Generates, persists, loads and destroys identity key material
pub struct KeyMaterialManager {
    store: Arc<dyn KeyValueStore>,
    kem: Arc<dyn KeyEncapsulationMechanism>,
    signer: Arc<dyn SignatureScheme>,
}

impl KeyMaterialManager {
    /// Create a manager over a persistence handle and the algorithms in use
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        kem: Arc<dyn KeyEncapsulationMechanism>,
        signer: Arc<dyn SignatureScheme>,
    ) -> Self {
        Self { store, kem, signer }
    }

    /// Generate all three key pairs and persist them as one record
    ///
    /// Nothing is written unless every key pair was generated. An existing
    /// identity is replaced.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` if any pair fails, or a storage
    /// error if the record cannot be written
    pub fn generate_identity(&self, username: &str) -> Result<(PublicKeyBundle, IdentityKeyPair)> {
        if username.trim().is_empty() {
            return Err(CryptoError::KeyGeneration {
                reason: "username must not be empty".to_string(),
            }
            .into());
        }

        let dh_pair = dh::generate_keypair();
        let kem_pair = self.kem.generate_keypair().map_err(key_generation)?;
        let sig_pair = self.signer.generate_keypair().map_err(key_generation)?;

        let identity = IdentityKeyPair {
            username: username.to_string(),
            dh_public_key: dh_pair.public_key,
            dh_private_key: dh_pair.private_key,
            kem_public_key: kem_pair.public_key,
            kem_private_key: kem_pair.private_key,
            sig_public_key: sig_pair.public_key,
            sig_private_key: sig_pair.private_key,
            kem_algorithm: self.kem.algorithm().to_string(),
            sig_algorithm: self.signer.algorithm().to_string(),
            created_at: chrono::Utc::now(),
        };
        identity.ensure_complete()?;

        save_json(self.store.as_ref(), IDENTITY_RECORD, &identity)?;

        let bundle = identity.public_bundle();
        info!(
            "Generated identity for {} ({})",
            identity.username,
            bundle.fingerprint()
        );
        Ok((bundle, identity))
    }

    /// Load the persisted identity, `None` if none has been generated
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record is unreadable, or
    /// `CryptoError::InvalidKey` if it is incomplete or was generated for a
    /// different signature algorithm
    pub fn load(&self) -> Result<Option<IdentityKeyPair>> {
        let Some(identity) = load_json::<IdentityKeyPair>(self.store.as_ref(), IDENTITY_RECORD)?
        else {
            debug!("No stored identity");
            return Ok(None);
        };

        identity.ensure_complete()?;
        if identity.sig_algorithm != self.signer.algorithm() {
            return Err(CryptoError::InvalidKey {
                reason: format!(
                    "stored identity uses {}, configured scheme is {}",
                    identity.sig_algorithm,
                    self.signer.algorithm()
                ),
            }
            .into());
        }

        debug!("Loaded identity for {}", identity.username);
        Ok(Some(identity))
    }

    /// Remove the persisted identity
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record cannot be removed
    pub fn destroy(&self) -> Result<()> {
        self.store.remove(IDENTITY_RECORD)?;
        info!("Destroyed stored identity");
        Ok(())
    }
}

fn key_generation(err: SpruceError) -> SpruceError {
    match err {
        SpruceError::Crypto(CryptoError::KeyGeneration { .. }) => err,
        other => CryptoError::KeyGeneration {
            reason: other.to_string(),
        }
        .into(),
    }
}
