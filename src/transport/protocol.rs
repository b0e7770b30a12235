//! Wire packets exchanged through the relay.
//!
//! Field names and encodings match the web client: camelCase JSON, binary
//! values as standard base64 strings, packet timestamps as RFC 3339.

use crate::session::{HandshakeMessage, Sealed};
use crate::utils::encoding;
use crate::utils::{CryptoError, HandshakeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest plaintext accepted for a single message (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Handshake carried from initiator to responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePacket {
    /// Initiator's username
    pub sender: String,
    /// Responder's username
    pub recipient: String,
    /// JSON of the signed handshake fields
    pub encrypted_content: String,
    /// Base64 signature over the handshake transcript
    pub signature: String,
    /// Unused for handshakes
    #[serde(default)]
    pub nonce: String,
    /// Unused for handshakes
    #[serde(default, alias = "aad")]
    pub associated_data: String,
    /// When the packet was built
    pub timestamp: DateTime<Utc>,
}

/// Handshake fields carried in `encryptedContent`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeContent {
    #[serde(alias = "ephemeralX25519PublicKey")]
    ephemeral_dh_public_key: String,
    #[serde(alias = "kyberCiphertext")]
    kem_ciphertext: String,
    timestamp: i64,
}

impl HandshakePacket {
    /// Wrap a signed handshake for `recipient`
    ///
    /// # Errors
    ///
    /// Returns a serialization error
    pub fn new(sender: &str, recipient: &str, message: &HandshakeMessage) -> Result<Self> {
        let content = HandshakeContent {
            ephemeral_dh_public_key: encoding::encode(&message.ephemeral_dh_public_key),
            kem_ciphertext: encoding::encode(&message.kem_ciphertext),
            timestamp: message.timestamp,
        };

        Ok(Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            encrypted_content: serde_json::to_string(&content)?,
            signature: encoding::encode(&message.signature),
            nonce: String::new(),
            associated_data: String::new(),
            timestamp: Utc::now(),
        })
    }

    /// Recover the signed handshake
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::InvalidPacket` if any field is absent or
    /// not decodable
    pub fn to_message(&self) -> std::result::Result<HandshakeMessage, HandshakeError> {
        let invalid = |reason: String| HandshakeError::InvalidPacket { reason };

        let content: HandshakeContent = serde_json::from_str(&self.encrypted_content)
            .map_err(|e| invalid(format!("unreadable handshake content: {e}")))?;
        let decode = |field: &str, value: &str| {
            if value.is_empty() {
                return Err(invalid(format!("missing {field}")));
            }
            encoding::decode(value).map_err(|e| invalid(format!("{field}: {e}")))
        };

        Ok(HandshakeMessage {
            ephemeral_dh_public_key: decode(
                "ephemeral public key",
                &content.ephemeral_dh_public_key,
            )?,
            kem_ciphertext: decode("KEM ciphertext", &content.kem_ciphertext)?,
            timestamp: content.timestamp,
            signature: decode("signature", &self.signature)?,
        })
    }
}

/// Encrypted application message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePacket {
    /// Sender's username
    pub sender: String,
    /// Recipient's username
    pub recipient: String,
    /// Base64 ciphertext with tag
    pub encrypted_content: String,
    /// Base64 12-byte nonce
    pub nonce: String,
    /// Base64 associated data; empty when none was bound
    #[serde(default, alias = "aad")]
    pub associated_data: String,
    /// When the message was sent
    pub timestamp: DateTime<Utc>,
    /// Unique message id, used to deduplicate retries
    pub message_id: String,
}

impl MessagePacket {
    /// Build a packet around a sealed message
    pub fn new(sender: &str, recipient: &str, sealed: &Sealed, aad: &[u8]) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            encrypted_content: encoding::encode(&sealed.ciphertext),
            nonce: encoding::encode(&sealed.nonce),
            associated_data: encoding::encode(aad),
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
        }
    }

    /// Decoded ciphertext
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decryption` for malformed base64
    pub fn ciphertext(&self) -> Result<Vec<u8>> {
        decode_field("ciphertext", &self.encrypted_content)
    }

    /// Decoded nonce
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decryption` for malformed base64
    pub fn nonce(&self) -> Result<Vec<u8>> {
        decode_field("nonce", &self.nonce)
    }

    /// Decoded associated data, empty if none
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decryption` for malformed base64
    pub fn associated_data(&self) -> Result<Vec<u8>> {
        if self.associated_data.is_empty() {
            return Ok(Vec::new());
        }
        decode_field("associated data", &self.associated_data)
    }
}

fn decode_field(field: &str, value: &str) -> Result<Vec<u8>> {
    encoding::decode(value).map_err(|e| {
        CryptoError::Decryption {
            reason: format!("malformed {field}: {e}"),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> HandshakeMessage {
        HandshakeMessage {
            ephemeral_dh_public_key: vec![1; 32],
            kem_ciphertext: vec![2; 1088],
            timestamp: 1_700_000_000_000,
            signature: vec![3; 64],
        }
    }

    #[test]
    fn test_handshake_packet_carries_message() {
        let message = sample_message();
        let packet = HandshakePacket::new("alice", "bob", &message).unwrap();

        assert!(packet.nonce.is_empty());
        assert!(packet.associated_data.is_empty());
        assert_eq!(packet.to_message().unwrap(), message);
    }

    #[test]
    fn test_handshake_packet_json_shape() {
        let packet = HandshakePacket::new("alice", "bob", &sample_message()).unwrap();
        let json: serde_json::Value = serde_json::to_value(&packet).unwrap();

        for field in [
            "sender",
            "recipient",
            "encryptedContent",
            "signature",
            "nonce",
            "associatedData",
            "timestamp",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn test_legacy_handshake_content_accepted() {
        let packet = HandshakePacket {
            sender: "alice".to_string(),
            recipient: "bob".to_string(),
            encrypted_content: r#"{"ephemeralX25519PublicKey":"AQID","kyberCiphertext":"BAUG","timestamp":7}"#
                .to_string(),
            signature: "CQ==".to_string(),
            nonce: String::new(),
            associated_data: String::new(),
            timestamp: Utc::now(),
        };
        let message = packet.to_message().unwrap();
        assert_eq!(message.ephemeral_dh_public_key, vec![1, 2, 3]);
        assert_eq!(message.signature, vec![9]);
    }

    #[test]
    fn test_missing_handshake_fields_rejected() {
        let mut packet = HandshakePacket::new("alice", "bob", &sample_message()).unwrap();
        packet.signature.clear();
        assert!(matches!(
            packet.to_message(),
            Err(HandshakeError::InvalidPacket { .. })
        ));

        packet.encrypted_content = r#"{"timestamp":7}"#.to_string();
        assert!(packet.to_message().is_err());
    }

    #[test]
    fn test_message_packet_accepts_aad_alias() {
        let json = r#"{
            "sender": "alice",
            "recipient": "bob",
            "encryptedContent": "AQID",
            "nonce": "AAAAAAAAAAAAAAAA",
            "aad": "",
            "timestamp": "2024-01-01T00:00:00Z",
            "messageId": "m-1"
        }"#;
        let packet: MessagePacket = serde_json::from_str(json).unwrap();
        assert_eq!(packet.ciphertext().unwrap(), vec![1, 2, 3]);
        assert_eq!(packet.nonce().unwrap().len(), 12);
        assert!(packet.associated_data().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_ciphertext_is_decryption_error() {
        let sealed = Sealed {
            ciphertext: vec![1, 2, 3],
            nonce: [0; 12],
        };
        let mut packet = MessagePacket::new("alice", "bob", &sealed, &[]);
        packet.encrypted_content = "%%%".to_string();
        assert!(matches!(
            packet.ciphertext(),
            Err(crate::utils::SpruceError::Crypto(CryptoError::Decryption { .. }))
        ));
    }
}
