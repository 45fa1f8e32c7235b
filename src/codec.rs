//! Byte/string conversions shared by the wire and persistence layers.
//!
//! All binary material crosses the wire as standard base64 with `=` padding,
//! except Ed25519 identity keys which travel as lowercase hex. Both
//! representations are part of the protocol contract.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

/// Encode bytes as standard base64 with padding.
#[must_use]
pub fn b64_encode(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Decode standard base64 (padded) into bytes.
pub fn b64_decode(value: &str) -> Result<Vec<u8>> {
    B64.decode(value).map_err(|_| Error::Malformed("invalid base64"))
}

/// Encode bytes as lowercase hex without separators.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode a hex string into bytes.
pub fn hex_decode(value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|_| Error::Malformed("invalid hex"))
}

/// View a slice as a fixed-size array, rejecting length mismatches.
pub fn as_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::Malformed("unexpected field length"))
}
