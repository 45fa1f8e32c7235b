//! The versioned message envelope and its header.
//!
//! Two payload versions exist. Version 1 is the legacy static-ECDH path for
//! peers that never published prekeys; it carries no header. Version 2 is
//! the ratchet path; its header is transmitted as a canonical JSON string
//! and doubles as the AEAD associated data, so the serialization is
//! byte-for-byte contract: UTF-8, keys in the order `dh, pn, n, ik, ek,
//! opk_id`, absent optional fields omitted, no insignificant whitespace.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Envelope version for the legacy static-ECDH path
pub const VERSION_V1: u8 = 1;

/// Envelope version for the Double Ratchet path
pub const VERSION_V2: u8 = 2;

/// Ratchet message header
///
/// `ik`, `ek` and `opk_id` appear only on the initial ciphertext that
/// triggers the peer's X3DH response: `ik` is the sender's Ed25519 identity
/// key in hex, `ek` the X3DH ephemeral public key in base64.
///
/// Field order below is the canonical serialization order. Do not reorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key, base64
    pub dh: String,
    /// Length of the sender's previous sending chain
    pub pn: u32,
    /// Message number within the current sending chain
    pub n: u32,
    /// Sender's Ed25519 identity key (hex), initial message only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ik: Option<String>,
    /// X3DH ephemeral public key (base64), initial message only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ek: Option<String>,
    /// Id of the one-time prekey consumed from the bundle, initial message only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opk_id: Option<u64>,
}

impl MessageHeader {
    /// Serialize to the canonical JSON form used as AEAD associated data
    #[must_use]
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(self).expect("header serializes to JSON")
    }

    /// Parse a received header string
    pub fn parse(value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|_| Error::Malformed("invalid message header"))
    }

    /// Whether the header carries X3DH bootstrap material
    #[must_use]
    pub fn has_bootstrap(&self) -> bool {
        self.ik.is_some() && self.ek.is_some()
    }
}

/// X3DH bootstrap material attached to a session's first ciphertext
#[derive(Debug, Clone)]
pub struct BootstrapKeys {
    /// Sender's Ed25519 identity key, hex
    pub identity_key: String,
    /// X3DH ephemeral public key, base64
    pub ephemeral_key: String,
    /// Consumed one-time prekey id, if the bundle carried one
    pub opk_id: Option<u64>,
}

/// Versioned wire payload handed to the message layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload version, 1 or 2
    pub version: u8,
    /// AEAD nonce, base64 (12 bytes)
    pub nonce: String,
    /// AEAD ciphertext, base64
    pub ciphertext: String,
    /// Canonical-JSON ratchet header, v2 only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}
