//! Authenticated encryption of application messages under the session key.
//!
//! Every message gets a fresh random 96-bit nonce. With nonce tracking
//! enabled the channel also remembers every nonce issued under the current
//! key and never hands out the same one twice.

use crate::session::store::SessionKey;
use crate::utils::{CryptoError, Result};
use aes_gcm::aead::{Aead, KeyInit, Nonce, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use log::trace;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// AEAD nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// AEAD tag length in bytes
pub const TAG_LEN: usize = 16;

const MAX_NONCE_ATTEMPTS: usize = 8;

/// AEAD algorithm for application messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    /// AES-256-GCM; what the web client speaks
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    /// ChaCha20-Poly1305
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aes256Gcm => write!(f, "aes-256-gcm"),
            Self::ChaCha20Poly1305 => write!(f, "chacha20-poly1305"),
        }
    }
}

/// Ciphertext (with tag) and the nonce it was sealed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ciphertext followed by the 16-byte tag
    pub ciphertext: Vec<u8>,
    /// Nonce used for this message
    pub nonce: [u8; NONCE_LEN],
}

#[derive(Default)]
struct NonceTracker {
    key: Option<(String, i64)>,
    issued: HashSet<[u8; NONCE_LEN]>,
}

/// Encrypts and decrypts messages with the session key
pub struct SecureChannel {
    suite: CipherSuite,
    tracker: Option<Mutex<NonceTracker>>,
}

impl SecureChannel {
    /// Create a channel; `track_nonces` enables the per-key nonce registry
    pub fn new(suite: CipherSuite, track_nonces: bool) -> Self {
        Self {
            suite,
            tracker: track_nonces.then(|| Mutex::new(NonceTracker::default())),
        }
    }

    /// AEAD in use
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Encrypt `plaintext` under `key`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Encryption` if sealing fails
    pub fn encrypt(&self, plaintext: &[u8], key: &SessionKey) -> Result<Sealed> {
        self.encrypt_with_aad(plaintext, key, &[])
    }

    /// Encrypt `plaintext` under `key`, authenticating `aad` as well
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Encryption` if sealing fails or no unused
    /// nonce could be drawn
    pub fn encrypt_with_aad(
        &self,
        plaintext: &[u8],
        key: &SessionKey,
        aad: &[u8],
    ) -> Result<Sealed> {
        let nonce = self.fresh_nonce(key)?;
        let payload = Payload { msg: plaintext, aad };

        let ciphertext = match self.suite {
            CipherSuite::Aes256Gcm => seal::<Aes256Gcm>(key, &nonce, payload),
            CipherSuite::ChaCha20Poly1305 => seal::<ChaCha20Poly1305>(key, &nonce, payload),
        }?;

        trace!("Sealed {} bytes for {}", plaintext.len(), key.peer());
        Ok(Sealed { ciphertext, nonce })
    }

    /// Decrypt `ciphertext` sealed under `key` and `nonce`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decryption` on tag mismatch, wrong key or
    /// malformed input
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8], key: &SessionKey) -> Result<Vec<u8>> {
        self.decrypt_with_aad(ciphertext, nonce, key, &[])
    }

    /// Decrypt with associated data
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decryption` on tag mismatch, wrong key, wrong
    /// associated data or malformed input
    pub fn decrypt_with_aad(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        key: &SessionKey,
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| CryptoError::Decryption {
            reason: format!("nonce must be {} bytes, got {}", NONCE_LEN, nonce.len()),
        })?;
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::Decryption {
                reason: "ciphertext shorter than the authentication tag".to_string(),
            }
            .into());
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match self.suite {
            CipherSuite::Aes256Gcm => open::<Aes256Gcm>(key, &nonce, payload),
            CipherSuite::ChaCha20Poly1305 => open::<ChaCha20Poly1305>(key, &nonce, payload),
        }
    }

    fn fresh_nonce(&self, key: &SessionKey) -> Result<[u8; NONCE_LEN]> {
        let Some(tracker) = &self.tracker else {
            return Ok(random_nonce());
        };

        let mut tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
        let key_id = (key.peer().to_string(), key.version());
        if tracker.key.as_ref() != Some(&key_id) {
            tracker.key = Some(key_id);
            tracker.issued.clear();
        }

        for _ in 0..MAX_NONCE_ATTEMPTS {
            let nonce = random_nonce();
            if tracker.issued.insert(nonce) {
                return Ok(nonce);
            }
        }
        Err(CryptoError::Encryption {
            reason: "could not draw an unused nonce".to_string(),
        }
        .into())
    }
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn seal<C: Aead + KeyInit>(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    payload: Payload<'_, '_>,
) -> Result<Vec<u8>> {
    let cipher = C::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Encryption {
        reason: "session key has the wrong length".to_string(),
    })?;
    cipher
        .encrypt(Nonce::<C>::from_slice(nonce), payload)
        .map_err(|_| {
            CryptoError::Encryption {
                reason: "AEAD seal failed".to_string(),
            }
            .into()
        })
}

fn open<C: Aead + KeyInit>(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    payload: Payload<'_, '_>,
) -> Result<Vec<u8>> {
    let cipher = C::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Decryption {
        reason: "session key has the wrong length".to_string(),
    })?;
    cipher
        .decrypt(Nonce::<C>::from_slice(nonce), payload)
        .map_err(|_| {
            CryptoError::Decryption {
                reason: "authentication tag mismatch".to_string(),
            }
            .into()
        })
}
