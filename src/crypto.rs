//! Key derivation primitives and the AEAD used for message bodies.
//!
//! Every derivation is deterministic: the info strings, the zero salt for
//! X3DH, and the HMAC tag bytes for the chain KDF are all part of the wire
//! contract. Changing any of them breaks interoperability with deployed
//! peers.

use crate::error::{Error, Result};
use crate::keys::DhOutput;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF info string for X3DH shared secret derivation
pub const X3DH_INFO: &[u8] = b"paracord:signal:x3dh";

/// HKDF info string for the Double Ratchet root chain
pub const RATCHET_INFO: &[u8] = b"paracord:signal:ratchet";

/// Size of derived keys (32 bytes for 256-bit security)
pub const KEY_SIZE: usize = 32;

/// Size of AES-256-GCM nonces
pub const NONCE_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Derived 32-byte symmetric key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get key as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for SymmetricKey {}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// X3DH key derivation
///
/// SK = HKDF-SHA256(salt = 32 zero bytes, ikm = DH1 || DH2 || DH3 [|| DH4],
/// info = `paracord:signal:x3dh`)
#[must_use]
pub fn x3dh_kdf(dh_outputs: &[&DhOutput]) -> SymmetricKey {
    let mut ikm = Vec::with_capacity(dh_outputs.len() * KEY_SIZE);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh.as_bytes());
    }

    let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; KEY_SIZE]), &ikm);
    let mut output = [0u8; KEY_SIZE];
    hkdf.expand(X3DH_INFO, &mut output)
        .expect("output size is valid");

    ikm.zeroize();
    SymmetricKey(output)
}

/// Root KDF for the Double Ratchet
///
/// (`new_root`, `new_chain`) = HKDF-SHA256(salt = `root_key`, ikm =
/// `dh_output`, info = `paracord:signal:ratchet`, 64 bytes) split 32/32.
#[must_use]
pub fn kdf_rk(root_key: &SymmetricKey, dh_output: &DhOutput) -> (SymmetricKey, SymmetricKey) {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output.as_bytes());

    let mut output = [0u8; KEY_SIZE * 2];
    hkdf.expand(RATCHET_INFO, &mut output)
        .expect("output size is valid");

    let new_root = SymmetricKey::from_bytes(output[..KEY_SIZE].try_into().expect("split is 32B"));
    let new_chain = SymmetricKey::from_bytes(output[KEY_SIZE..].try_into().expect("split is 32B"));

    output.zeroize();
    (new_root, new_chain)
}

/// Chain KDF for the Double Ratchet
///
/// `message_key` = HMAC-SHA256(`chain_key`, 0x01)
/// `next_chain_key` = HMAC-SHA256(`chain_key`, 0x02)
#[must_use]
pub fn kdf_ck(chain_key: &SymmetricKey) -> (SymmetricKey, SymmetricKey) {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(chain_key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(&[0x01]);
    let message_key = SymmetricKey::from_bytes(mac.finalize().into_bytes().into());

    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(chain_key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(&[0x02]);
    let next_chain_key = SymmetricKey::from_bytes(mac.finalize().into_bytes().into());

    (next_chain_key, message_key)
}

/// Generate a fresh random AEAD nonce
pub fn random_nonce<R: CryptoRngCore>(rng: &mut R) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt with AES-256-GCM, binding `associated_data` into the tag
pub fn seal(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| Error::Malformed("invalid AEAD key length"))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::DecryptFailed)
}

/// Decrypt with AES-256-GCM; any tag mismatch surfaces as [`Error::DecryptFailed`]
pub fn open(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| Error::Malformed("invalid AEAD key length"))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::DecryptFailed)
}
