//! Error types and handling for the Spruce session layer.
//!
//! Every crypto boundary returns a typed [`Result`]. Handshake failures are
//! terminal for the attempt, decryption failures are recoverable (they feed the
//! retry queue), and session derivation failures force a fresh handshake.

use thiserror::Error;

/// Result type alias for the session layer
pub type Result<T> = std::result::Result<T, SpruceError>;

/// Top-level error for all session-layer operations
#[derive(Error, Debug)]
pub enum SpruceError {
    /// Cryptographic primitive errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Handshake protocol errors
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Session key lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Errors raised by the transport collaborator
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Errors raised by the persistence collaborator
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Cryptographic primitive errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// One of the identity key pairs could not be generated
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Key material has the wrong size or encoding
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Authenticated encryption failed
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Tag mismatch, wrong key or malformed ciphertext
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Diffie-Hellman produced a non-contributory result
    #[error("Key agreement failed: {reason}")]
    KeyAgreement { reason: String },

    /// Signing failed
    #[error("Signing failed: {reason}")]
    Signing { reason: String },

    /// Signature did not verify
    #[error("Signature verification failed")]
    SignatureVerification,
}

/// Handshake protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Required fields are missing or malformed
    #[error("Invalid handshake packet: {reason}")]
    InvalidPacket { reason: String },

    /// Signature over the handshake transcript did not verify
    #[error("Invalid handshake signature")]
    InvalidSignature,

    /// KEM encapsulation against the peer's public key failed
    #[error("KEM encapsulation failed: {reason}")]
    EncapsulationFailure { reason: String },

    /// KEM decapsulation with our private key failed
    #[error("KEM decapsulation failed: {reason}")]
    DecapsulationFailure { reason: String },

    /// Classical agreement failed
    #[error("Key agreement failed: {reason}")]
    KeyAgreementFailure { reason: String },

    /// A handshake with this peer is already in flight
    #[error("Handshake already in flight with {peer}")]
    AlreadyInFlight { peer: String },
}

/// Session key lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Derivation from shared secrets failed
    #[error("Session derivation failed: {reason}")]
    Derivation { reason: String },

    /// No session key is installed
    #[error("No active session")]
    NoActiveSession,

    /// The installed session belongs to a different peer
    #[error("Session is bound to {expected}, not {actual}")]
    PeerMismatch { expected: String, actual: String },

    /// No identity key material has been generated
    #[error("No identity key material found")]
    NoIdentity,
}

/// Transport collaborator errors, propagated unchanged
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The relay or peer could not be reached
    #[error("Recipient unreachable: {reason}")]
    Unreachable { reason: String },

    /// The user is not registered with the relay
    #[error("Unknown user: {username}")]
    UnknownUser { username: String },

    /// The relay refused the request
    #[error("Request rejected: {reason}")]
    Rejected { reason: String },
}

/// Persistence collaborator errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Reading a record failed
    #[error("Failed to read {key}: {reason}")]
    Read { key: String, reason: String },

    /// Writing a record failed
    #[error("Failed to write {key}: {reason}")]
    Write { key: String, reason: String },

    /// A stored record could not be decoded
    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Configuration and setup errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

impl SpruceError {
    /// Returns true if the operation may succeed later without user action
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::Decryption { .. })
                | Self::Transport(TransportError::Unreachable { .. })
                | Self::Handshake(HandshakeError::AlreadyInFlight { .. })
        )
    }

    /// Returns true if this error indicates tampering or impersonation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Handshake(HandshakeError::InvalidSignature)
                | Self::Crypto(CryptoError::SignatureVerification)
                | Self::Crypto(CryptoError::Decryption { .. })
        )
    }

    /// Returns true if persisted session state must be discarded
    pub fn requires_reset(&self) -> bool {
        matches!(self, Self::Session(SessionError::Derivation { .. }))
    }
}

impl From<std::io::Error> for SpruceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SpruceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
