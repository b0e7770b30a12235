//! Session key derivation, persistence and idle expiry.
//!
//! Only the two shared secrets are persisted; the session key itself lives
//! in memory and is re-derived on restart. A session is cleared once it has
//! been idle for the configured timeout; expiry waits while a handshake is in
//! flight.

use crate::crypto::SecretBytes;
use crate::storage::{load_json, KeyValueStore, SESSION_RECORD};
use crate::utils::encoding::b64_secret;
use crate::utils::{Result, SessionError, SpruceError, StorageError};
use hkdf::Hkdf;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

/// HKDF salt for session key derivation
pub const SESSION_SALT: &[u8] = b"Spruce-Hybrid-Session";

/// HKDF info for session key derivation
pub const SESSION_INFO: &[u8] = b"Spruce-Hybrid-Session";

/// Session key length in bytes
pub const SESSION_KEY_LEN: usize = 32;

/// Delay before a deferred expiry is checked again
const EXPIRY_RECHECK: Duration = Duration::from_secs(1);

/// The two shared secrets a session key is derived from
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKeyComponents {
    /// Peer the session is bound to
    pub peer: String,
    /// X25519 shared secret
    #[serde(with = "b64_secret", alias = "x25519SharedSecret")]
    pub dh_shared_secret: SecretBytes,
    /// ML-KEM shared secret
    #[serde(with = "b64_secret", alias = "kyberSharedSecret")]
    pub kem_shared_secret: SecretBytes,
    /// Creation time in Unix milliseconds; also the session version
    pub version: i64,
}

impl SessionKeyComponents {
    /// Bundle freshly agreed secrets, stamped with the current time
    pub fn new(peer: &str, dh_shared_secret: SecretBytes, kem_shared_secret: SecretBytes) -> Self {
        Self {
            peer: peer.to_string(),
            dh_shared_secret,
            kem_shared_secret,
            version: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl fmt::Debug for SessionKeyComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyComponents")
            .field("peer", &self.peer)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Symmetric key for the current session
pub struct SessionKey {
    key: Zeroizing<[u8; SESSION_KEY_LEN]>,
    peer: String,
    version: i64,
}

impl SessionKey {
    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.key
    }

    /// Peer the key is bound to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Version of the components the key was derived from
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Short fingerprint for logs; safe to print
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.key.as_slice())[..4])
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("peer", &self.peer)
            .field("version", &self.version)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Decides whether an idle session may be cleared, and hears when it is
pub trait ExpiryGate: Send + Sync {
    /// False while a handshake is in flight
    fn may_expire(&self) -> bool;

    /// Called after the session bound to `peer` was cleared by the timer
    fn expired(&self, peer: &str);
}

#[derive(Default)]
struct StoreState {
    key: Option<Arc<SessionKey>>,
}

struct StoreInner {
    persistence: Arc<dyn KeyValueStore>,
    idle_timeout: Duration,
    refresh_on_activity: bool,
    gate: Option<Arc<dyn ExpiryGate>>,
    state: RwLock<StoreState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Holds the process-wide session key
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct SessionKeyStore {
    inner: Arc<StoreInner>,
}

impl SessionKeyStore {
    /// Create an empty store
    pub fn new(
        persistence: Arc<dyn KeyValueStore>,
        idle_timeout: Duration,
        refresh_on_activity: bool,
        gate: Option<Arc<dyn ExpiryGate>>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                persistence,
                idle_timeout,
                refresh_on_activity,
                gate,
                state: RwLock::new(StoreState::default()),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Derive the session key from its components
    ///
    /// `HKDF-SHA256(salt, SHA-256(dh || kem), info)` truncated to 32 bytes.
    /// Identical components always yield the identical key.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Derivation` if either secret is empty
    pub fn derive(components: &SessionKeyComponents) -> Result<SessionKey> {
        if components.dh_shared_secret.is_empty() || components.kem_shared_secret.is_empty() {
            return Err(SessionError::Derivation {
                reason: "missing shared secret".to_string(),
            }
            .into());
        }

        let mut ikm = Zeroizing::new(Vec::with_capacity(
            components.dh_shared_secret.len() + components.kem_shared_secret.len(),
        ));
        ikm.extend_from_slice(&components.dh_shared_secret);
        ikm.extend_from_slice(&components.kem_shared_secret);
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(Sha256::digest(ikm.as_slice()).into());

        let hk = Hkdf::<Sha256>::new(Some(SESSION_SALT), seed.as_slice());
        let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        hk.expand(SESSION_INFO, &mut key[..])
            .map_err(|e| SessionError::Derivation {
                reason: e.to_string(),
            })?;

        Ok(SessionKey {
            key,
            peer: components.peer.clone(),
            version: components.version,
        })
    }

    /// Derive, persist and install a new session, replacing any previous one
    ///
    /// Components are persisted before the key is installed; if persisting
    /// fails nothing changes. Arms the idle timer.
    ///
    /// # Errors
    ///
    /// Returns a derivation or storage error
    pub async fn publish(&self, components: SessionKeyComponents) -> Result<Arc<SessionKey>> {
        let key = Arc::new(Self::derive(&components)?);

        let mut state = self.inner.state.write().await;
        self.persist(&components)?;
        state.key = Some(key.clone());
        self.arm_expiry(key.peer(), key.version(), self.inner.idle_timeout);
        drop(state);

        info!(
            "Session with {} established (version {}, key {})",
            key.peer(),
            key.version(),
            key.fingerprint()
        );
        Ok(key)
    }

    /// Write components to the persistence record
    ///
    /// # Errors
    ///
    /// Returns a serialization or storage error
    pub fn persist(&self, components: &SessionKeyComponents) -> Result<()> {
        let bytes = Zeroizing::new(serde_json::to_vec(components)?);
        self.inner.persistence.set(SESSION_RECORD, &bytes)
    }

    /// Re-derive the session from persisted components after a restart
    ///
    /// Returns `None` if nothing is persisted or the persisted session has
    /// already outlived the idle timeout. Unreadable or underivable
    /// components are purged.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Derivation` after purging bad components, or a
    /// storage error if the record cannot be read
    pub async fn reload(&self) -> Result<Option<Arc<SessionKey>>> {
        let loaded = load_json::<SessionKeyComponents>(self.inner.persistence.as_ref(), SESSION_RECORD);
        let components = match loaded {
            Ok(Some(components)) => components,
            Ok(None) => return Ok(None),
            Err(SpruceError::Storage(StorageError::Corrupt { reason, .. })) => {
                warn!("Discarding unreadable session components: {}", reason);
                self.inner.persistence.remove(SESSION_RECORD)?;
                return Err(SessionError::Derivation { reason }.into());
            }
            Err(e) => return Err(e),
        };

        let key = match Self::derive(&components) {
            Ok(key) => Arc::new(key),
            Err(e) => {
                warn!("Discarding session components that fail to derive: {}", e);
                self.inner.persistence.remove(SESSION_RECORD)?;
                return Err(e);
            }
        };

        // Without activity refresh the session's age is its creation age
        let age = if self.inner.refresh_on_activity {
            Duration::ZERO
        } else {
            let age_ms = chrono::Utc::now().timestamp_millis() - components.version;
            Duration::from_millis(u64::try_from(age_ms).unwrap_or(0))
        };
        if age >= self.inner.idle_timeout {
            info!("Persisted session with {} already expired", components.peer);
            self.inner.persistence.remove(SESSION_RECORD)?;
            return Ok(None);
        }

        let mut state = self.inner.state.write().await;
        state.key = Some(key.clone());
        self.arm_expiry(key.peer(), key.version(), self.inner.idle_timeout - age);
        drop(state);

        info!(
            "Restored session with {} (version {})",
            key.peer(),
            key.version()
        );
        Ok(Some(key))
    }

    /// Current session key, if any
    pub async fn current(&self) -> Option<Arc<SessionKey>> {
        self.inner.state.read().await.key.clone()
    }

    /// Re-arm the idle timer after activity, if configured to
    pub async fn touch(&self) {
        if !self.inner.refresh_on_activity {
            return;
        }
        let state = self.inner.state.read().await;
        if let Some(key) = &state.key {
            self.arm_expiry(key.peer(), key.version(), self.inner.idle_timeout);
        }
    }

    /// Clear the session if it is still `version` and no handshake is in flight
    ///
    /// Returns whether the session was cleared.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the persisted record cannot be removed
    pub async fn expire_if_current(&self, version: i64) -> Result<bool> {
        let mut state = self.inner.state.write().await;
        let peer = match &state.key {
            Some(key) if key.version() == version => key.peer().to_string(),
            _ => {
                debug!("Session version {} already replaced", version);
                return Ok(false);
            }
        };

        // Checked under the write lock so no handshake can publish in between
        if let Some(gate) = &self.inner.gate {
            if !gate.may_expire() {
                debug!("Deferring session expiry while a handshake is in flight");
                self.arm_expiry(&peer, version, EXPIRY_RECHECK);
                return Ok(false);
            }
        }

        state.key = None;
        self.inner.persistence.remove(SESSION_RECORD)?;
        drop(state);

        info!("Session with {} expired after idle timeout", peer);
        if let Some(gate) = &self.inner.gate {
            gate.expired(&peer);
        }
        Ok(true)
    }

    /// Drop the session from memory and persistence and stop the timer
    ///
    /// # Errors
    ///
    /// Returns a storage error if the persisted record cannot be removed
    pub async fn clear(&self) -> Result<()> {
        self.cancel_timer();
        let mut state = self.inner.state.write().await;
        state.key = None;
        self.inner.persistence.remove(SESSION_RECORD)?;
        debug!("Session cleared");
        Ok(())
    }

    /// Stop the idle timer without touching the session
    pub fn cancel_timer(&self) {
        let mut timer = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }

    fn arm_expiry(&self, peer: &str, version: i64, after: Duration) {
        let store = self.clone();
        let peer = peer.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Err(e) = store.expire_if_current(version).await {
                warn!("Failed to expire session with {}: {}", peer, e);
            }
        });

        let mut timer = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }
}
