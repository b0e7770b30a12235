//! Hybrid handshake between two identities.
//!
//! The initiator generates an ephemeral X25519 key, encapsulates to the
//! peer's ML-KEM key and agrees with the peer's static X25519 key. The
//! ephemeral public key, KEM ciphertext and a timestamp are signed and sent.
//! The responder verifies the signature before touching its private keys,
//! then recovers both secrets. Both sides publish the same
//! [`SessionKeyComponents`] to their [`SessionKeyStore`].
//!
//! At most one handshake per peer is in flight; a second attempt fails with
//! [`HandshakeError::AlreadyInFlight`] rather than racing the first.

use crate::crypto::dh::{self, EphemeralDh};
use crate::crypto::{IdentityKeyPair, KeyEncapsulationMechanism, PublicKeyBundle, SignatureScheme};
use crate::session::store::{ExpiryGate, SessionKey, SessionKeyComponents, SessionKeyStore};
use crate::utils::encoding::b64;
use crate::utils::{CryptoError, HandshakeError, Result, SpruceError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Per-peer handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeState {
    /// Nothing attempted, or reset
    Idle,
    /// We are building an outgoing handshake
    Initiating,
    /// We are processing an incoming handshake
    Completing,
    /// A session key was published
    Established,
    /// The last attempt failed
    Failed,
}

impl HandshakeState {
    /// Whether a handshake is currently running
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Initiating | Self::Completing)
    }
}

/// Handshake state for every peer seen by this process
#[derive(Debug, Default)]
pub struct HandshakeRegistry {
    states: Mutex<HashMap<String, HandshakeState>>,
}

impl HandshakeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// State for `peer`; `Idle` if never seen
    pub fn state(&self, peer: &str) -> HandshakeState {
        self.lock()
            .get(peer)
            .copied()
            .unwrap_or(HandshakeState::Idle)
    }

    /// Whether any handshake is running
    pub fn any_in_flight(&self) -> bool {
        self.lock().values().any(|state| state.is_in_flight())
    }

    /// Record `state` for `peer` unconditionally
    pub fn set(&self, peer: &str, state: HandshakeState) {
        self.lock().insert(peer.to_string(), state);
    }

    /// Forget every peer
    pub fn reset_all(&self) {
        self.lock().clear();
    }

    /// Claim `peer` for a new handshake
    ///
    /// The returned guard marks the attempt `Failed` when dropped unless
    /// [`InFlightGuard::establish`] was called.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::AlreadyInFlight` if one is already running
    pub fn begin(
        self: &Arc<Self>,
        peer: &str,
        state: HandshakeState,
    ) -> std::result::Result<InFlightGuard, HandshakeError> {
        let mut states = self.lock();
        if states.get(peer).is_some_and(|s| s.is_in_flight()) {
            return Err(HandshakeError::AlreadyInFlight {
                peer: peer.to_string(),
            });
        }
        states.insert(peer.to_string(), state);

        Ok(InFlightGuard {
            registry: Arc::clone(self),
            peer: peer.to_string(),
            established: false,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HandshakeState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExpiryGate for HandshakeRegistry {
    fn may_expire(&self) -> bool {
        !self.any_in_flight()
    }

    fn expired(&self, peer: &str) {
        let mut states = self.lock();
        if let Some(state) = states.get_mut(peer) {
            if *state == HandshakeState::Established {
                *state = HandshakeState::Idle;
            }
        }
    }
}

/// Exclusive claim on a peer's handshake slot
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<HandshakeRegistry>,
    peer: String,
    established: bool,
}

impl InFlightGuard {
    /// Mark the handshake as established
    pub fn establish(mut self) {
        self.established = true;
        self.registry.set(&self.peer, HandshakeState::Established);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.established {
            warn!("Handshake with {} failed", self.peer);
            self.registry.set(&self.peer, HandshakeState::Failed);
        }
    }
}

/// Signed handshake sent from initiator to responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    /// Initiator's ephemeral X25519 public key
    #[serde(with = "b64", alias = "ephemeralX25519PublicKey")]
    pub ephemeral_dh_public_key: Vec<u8>,
    /// ML-KEM ciphertext encapsulated to the responder
    #[serde(with = "b64", alias = "kyberCiphertext")]
    pub kem_ciphertext: Vec<u8>,
    /// Creation time in Unix milliseconds
    pub timestamp: i64,
    /// Initiator's signature over [`HandshakeMessage::transcript`]
    #[serde(with = "b64", alias = "dilithiumSignature")]
    pub signature: Vec<u8>,
}

/// Signed portion of a handshake, field names fixed for interoperability
#[derive(Serialize)]
struct Transcript<'a> {
    #[serde(rename = "ephemeralX25519PublicKey")]
    ephemeral: String,
    #[serde(rename = "kyberCiphertext")]
    ciphertext: String,
    timestamp: &'a i64,
}

impl HandshakeMessage {
    /// Canonical bytes covered by the signature
    ///
    /// # Errors
    ///
    /// Returns a serialization error
    pub fn transcript(&self) -> Result<Vec<u8>> {
        let transcript = Transcript {
            ephemeral: crate::utils::encoding::encode(&self.ephemeral_dh_public_key),
            ciphertext: crate::utils::encoding::encode(&self.kem_ciphertext),
            timestamp: &self.timestamp,
        };
        Ok(serde_json::to_vec(&transcript)?)
    }

    fn ensure_complete(&self) -> std::result::Result<(), HandshakeError> {
        let missing = if self.ephemeral_dh_public_key.is_empty() {
            Some("ephemeral public key")
        } else if self.kem_ciphertext.is_empty() {
            Some("KEM ciphertext")
        } else if self.signature.is_empty() {
            Some("signature")
        } else {
            None
        };

        match missing {
            Some(field) => Err(HandshakeError::InvalidPacket {
                reason: format!("missing {field}"),
            }),
            None => Ok(()),
        }
    }
}

/// Runs both sides of the hybrid handshake for the local identity
pub struct HandshakeProtocol {
    identity: Arc<IdentityKeyPair>,
    kem: Arc<dyn KeyEncapsulationMechanism>,
    signer: Arc<dyn SignatureScheme>,
    store: SessionKeyStore,
    registry: Arc<HandshakeRegistry>,
    max_age: Duration,
    max_skew: Duration,
}

impl HandshakeProtocol {
    /// Create a protocol instance publishing into `store`
    pub fn new(
        identity: Arc<IdentityKeyPair>,
        kem: Arc<dyn KeyEncapsulationMechanism>,
        signer: Arc<dyn SignatureScheme>,
        store: SessionKeyStore,
        registry: Arc<HandshakeRegistry>,
    ) -> Self {
        Self {
            identity,
            kem,
            signer,
            store,
            registry,
            max_age: Duration::from_secs(crate::defaults::DEFAULT_HANDSHAKE_MAX_AGE_SECS),
            max_skew: Duration::from_secs(crate::defaults::MAX_CLOCK_SKEW_SECS),
        }
    }

    /// Set the oldest acceptable handshake age
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Current state for `peer`
    pub fn status(&self, peer: &str) -> HandshakeState {
        self.registry.state(peer)
    }

    /// Start a handshake with `peer`
    ///
    /// On success the session is already published locally and the returned
    /// message must be delivered to the peer.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInFlight`, `EncapsulationFailure` or
    /// `KeyAgreementFailure`; on any error no session is published
    pub async fn initiate(
        &self,
        peer: &str,
        peer_keys: &PublicKeyBundle,
    ) -> Result<HandshakeMessage> {
        let guard = self.registry.begin(peer, HandshakeState::Initiating)?;
        debug!("Initiating handshake with {}", peer);

        let ephemeral = EphemeralDh::generate();
        let ephemeral_public = ephemeral.public_key_bytes().to_vec();

        let (kem_ciphertext, kem_shared) = self.kem.encapsulate(&peer_keys.kem_public_key)?;
        let dh_shared = ephemeral
            .agree(&peer_keys.dh_public_key)
            .map_err(key_agreement)?;

        let mut message = HandshakeMessage {
            ephemeral_dh_public_key: ephemeral_public,
            kem_ciphertext,
            timestamp: chrono::Utc::now().timestamp_millis(),
            signature: Vec::new(),
        };
        message.signature = self
            .signer
            .sign(self.identity.sig_private_key(), &message.transcript()?)?;

        let components = SessionKeyComponents::new(peer, dh_shared, kem_shared);
        self.store.publish(components).await?;
        guard.establish();

        info!("Handshake with {} initiated", peer);
        Ok(message)
    }

    /// Accept a handshake initiated by `peer`
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacket` for missing fields or a stale timestamp,
    /// `InvalidSignature` if the transcript does not verify against
    /// `peer_keys`, `DecapsulationFailure` or `KeyAgreementFailure`; on any
    /// error no session is published
    pub async fn complete(
        &self,
        peer: &str,
        message: &HandshakeMessage,
        peer_keys: &PublicKeyBundle,
    ) -> Result<Arc<SessionKey>> {
        let guard = self.registry.begin(peer, HandshakeState::Completing)?;
        let key = self.respond(peer, message, peer_keys).await?;
        guard.establish();

        info!("Handshake with {} completed", peer);
        Ok(key)
    }

    /// Like [`HandshakeProtocol::complete`] but parses the message under the
    /// in-flight claim, so malformed input is recorded as a failed attempt
    ///
    /// # Errors
    ///
    /// Same as [`HandshakeProtocol::complete`]
    pub async fn complete_with<F>(
        &self,
        peer: &str,
        parse: F,
        peer_keys: &PublicKeyBundle,
    ) -> Result<Arc<SessionKey>>
    where
        F: FnOnce() -> std::result::Result<HandshakeMessage, HandshakeError> + Send,
    {
        let guard = self.registry.begin(peer, HandshakeState::Completing)?;
        let message = parse()?;
        let key = self.respond(peer, &message, peer_keys).await?;
        guard.establish();

        info!("Handshake with {} completed", peer);
        Ok(key)
    }

    async fn respond(
        &self,
        peer: &str,
        message: &HandshakeMessage,
        peer_keys: &PublicKeyBundle,
    ) -> Result<Arc<SessionKey>> {
        debug!("Completing handshake from {}", peer);
        message.ensure_complete()?;
        self.check_freshness(message.timestamp)?;

        self.signer
            .verify(&peer_keys.sig_public_key, &message.transcript()?, &message.signature)
            .map_err(|_| HandshakeError::InvalidSignature)?;

        let kem_shared = self
            .kem
            .decapsulate(self.identity.kem_private_key(), &message.kem_ciphertext)?;
        let dh_shared = dh::agree(
            self.identity.dh_private_key(),
            &message.ephemeral_dh_public_key,
        )
        .map_err(key_agreement)?;

        let components = SessionKeyComponents::new(peer, dh_shared, kem_shared);
        self.store.publish(components).await
    }

    fn check_freshness(&self, timestamp: i64) -> std::result::Result<(), HandshakeError> {
        let now = chrono::Utc::now().timestamp_millis();
        let age_ms = now
            .checked_sub(timestamp)
            .ok_or_else(|| HandshakeError::InvalidPacket {
                reason: format!("handshake timestamp {timestamp} out of range"),
            })?;
        let max_age_ms = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        let max_skew_ms = i64::try_from(self.max_skew.as_millis()).unwrap_or(i64::MAX);

        if age_ms > max_age_ms {
            return Err(HandshakeError::InvalidPacket {
                reason: format!("handshake is {}s old", age_ms / 1000),
            });
        }
        if age_ms.saturating_neg() > max_skew_ms {
            return Err(HandshakeError::InvalidPacket {
                reason: "handshake timestamp is in the future".to_string(),
            });
        }
        Ok(())
    }
}

fn key_agreement(err: SpruceError) -> SpruceError {
    match err {
        SpruceError::Crypto(CryptoError::InvalidKey { reason })
        | SpruceError::Crypto(CryptoError::KeyAgreement { reason }) => {
            HandshakeError::KeyAgreementFailure { reason }.into()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyMaterialManager, MlDsa65, MlKem768};
    use crate::storage::{MemoryStore, SESSION_RECORD};

    struct Party {
        bundle: PublicKeyBundle,
        protocol: HandshakeProtocol,
        store: SessionKeyStore,
        persistence: Arc<MemoryStore>,
    }

    fn party(name: &str) -> Party {
        let persistence = Arc::new(MemoryStore::new());
        let kem: Arc<dyn KeyEncapsulationMechanism> = Arc::new(MlKem768);
        let signer: Arc<dyn SignatureScheme> = Arc::new(MlDsa65);
        let (bundle, identity) =
            KeyMaterialManager::new(persistence.clone(), kem.clone(), signer.clone())
                .generate_identity(name)
                .unwrap();

        let registry = Arc::new(HandshakeRegistry::new());
        let store = SessionKeyStore::new(
            persistence.clone(),
            Duration::from_secs(60),
            false,
            Some(registry.clone()),
        );
        let protocol =
            HandshakeProtocol::new(Arc::new(identity), kem, signer, store.clone(), registry);

        Party {
            bundle,
            protocol,
            store,
            persistence,
        }
    }

    #[tokio::test]
    async fn test_both_sides_derive_same_key() {
        let alice = party("alice");
        let bob = party("bob");

        let message = alice.protocol.initiate("bob", &bob.bundle).await.unwrap();
        let bob_key = bob
            .protocol
            .complete("alice", &message, &alice.bundle)
            .await
            .unwrap();
        let alice_key = alice.store.current().await.unwrap();

        assert_eq!(alice_key.as_bytes(), bob_key.as_bytes());
        assert_eq!(alice.protocol.status("bob"), HandshakeState::Established);
        assert_eq!(bob.protocol.status("alice"), HandshakeState::Established);
        assert!(bob.persistence.contains(SESSION_RECORD));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_rejected_before_decapsulation() {
        let alice = party("alice");
        let bob = party("bob");

        let mut message = alice.protocol.initiate("bob", &bob.bundle).await.unwrap();
        message.kem_ciphertext[0] ^= 0x01;

        let err = bob
            .protocol
            .complete("alice", &message, &alice.bundle)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SpruceError::Handshake(HandshakeError::InvalidSignature)
        ));
        assert!(bob.store.current().await.is_none());
        assert!(!bob.persistence.contains(SESSION_RECORD));
        assert_eq!(bob.protocol.status("alice"), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_wrong_signer_rejected() {
        let alice = party("alice");
        let bob = party("bob");
        let mallory = party("mallory");

        let message = mallory.protocol.initiate("bob", &bob.bundle).await.unwrap();
        let err = bob
            .protocol
            .complete("alice", &message, &alice.bundle)
            .await
            .unwrap_err();
        assert!(err.is_security_violation());
    }

    #[tokio::test]
    async fn test_stale_handshake_rejected() {
        let alice = party("alice");
        let bob = party("bob");

        let message = alice.protocol.initiate("bob", &bob.bundle).await.unwrap();
        let strict = HandshakeProtocol {
            max_age: Duration::ZERO,
            ..bob.protocol
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = strict
            .complete("alice", &message, &alice.bundle)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SpruceError::Handshake(HandshakeError::InvalidPacket { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_timestamps_rejected() {
        let alice = party("alice");
        let bob = party("bob");
        let message = alice.protocol.initiate("bob", &bob.bundle).await.unwrap();

        for timestamp in [i64::MIN, i64::MAX, -1] {
            let forged = HandshakeMessage {
                timestamp,
                ..message.clone()
            };
            let err = bob
                .protocol
                .complete("alice", &forged, &alice.bundle)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                SpruceError::Handshake(HandshakeError::InvalidPacket { .. })
            ));
        }
        assert!(bob.store.current().await.is_none());
        assert_eq!(bob.protocol.status("alice"), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let alice = party("alice");
        let bob = party("bob");

        let mut message = alice.protocol.initiate("bob", &bob.bundle).await.unwrap();
        message.signature.clear();

        let err = bob
            .protocol
            .complete("alice", &message, &alice.bundle)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SpruceError::Handshake(HandshakeError::InvalidPacket { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_peer_kem_key_publishes_nothing() {
        let alice = party("alice");
        let mut bob = party("bob").bundle;
        bob.kem_public_key.truncate(10);

        let err = alice.protocol.initiate("bob", &bob).await.unwrap_err();
        assert!(matches!(
            err,
            SpruceError::Handshake(HandshakeError::EncapsulationFailure { .. })
        ));
        assert!(alice.store.current().await.is_none());
        assert!(!alice.persistence.contains(SESSION_RECORD));
        assert_eq!(alice.protocol.status("bob"), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_bad_peer_dh_key_is_agreement_failure() {
        let alice = party("alice");
        let mut bob = party("bob").bundle;
        bob.dh_public_key = vec![0u8; 32];

        let err = alice.protocol.initiate("bob", &bob).await.unwrap_err();
        assert!(matches!(
            err,
            SpruceError::Handshake(HandshakeError::KeyAgreementFailure { .. })
        ));
    }

    #[test]
    fn test_second_claim_rejected_while_in_flight() {
        let registry = Arc::new(HandshakeRegistry::new());
        let guard = registry.begin("bob", HandshakeState::Initiating).unwrap();

        assert_eq!(
            registry.begin("bob", HandshakeState::Completing).unwrap_err(),
            HandshakeError::AlreadyInFlight {
                peer: "bob".to_string()
            }
        );
        assert!(registry.begin("carol", HandshakeState::Initiating).is_ok());
        assert!(!registry.may_expire());

        guard.establish();
        assert_eq!(registry.state("bob"), HandshakeState::Established);
    }

    #[test]
    fn test_expiry_leaves_in_flight_claim_alone() {
        let registry = Arc::new(HandshakeRegistry::new());
        let guard = registry.begin("bob", HandshakeState::Initiating).unwrap();

        registry.expired("bob");
        assert_eq!(registry.state("bob"), HandshakeState::Initiating);
        assert!(registry.begin("bob", HandshakeState::Completing).is_err());

        guard.establish();
        registry.expired("bob");
        assert_eq!(registry.state("bob"), HandshakeState::Idle);
    }

    #[test]
    fn test_dropped_claim_marks_failed() {
        let registry = Arc::new(HandshakeRegistry::new());
        drop(registry.begin("bob", HandshakeState::Initiating).unwrap());
        assert_eq!(registry.state("bob"), HandshakeState::Failed);
        assert!(registry.begin("bob", HandshakeState::Initiating).is_ok());
    }

    #[test]
    fn test_transcript_uses_stable_field_names() {
        let message = HandshakeMessage {
            ephemeral_dh_public_key: vec![1, 2, 3],
            kem_ciphertext: vec![4, 5, 6],
            timestamp: 42,
            signature: vec![9],
        };
        let transcript = String::from_utf8(message.transcript().unwrap()).unwrap();
        assert_eq!(
            transcript,
            r#"{"ephemeralX25519PublicKey":"AQID","kyberCiphertext":"BAUG","timestamp":42}"#
        );
    }
}
