//! Cryptographic key types and curve adapters.
//!
//! The platform uses a single Ed25519 identity per account. Key agreement
//! happens on Curve25519 in Montgomery form, so both halves of the identity
//! are converted: the secret through its SHA-512-derived scalar, the public
//! through the birational Edwards-to-Montgomery map. A DH computed between
//! two converted keys agrees regardless of which side converted first.

use crate::codec;
use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::CryptoRngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 public key (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Size in bytes
    pub const SIZE: usize = 32;

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from standard base64
    pub fn from_b64(value: &str) -> Result<Self> {
        Ok(Self(codec::as_array(&codec::b64_decode(value)?)?))
    }

    /// Encode as standard base64
    #[must_use]
    pub fn to_b64(&self) -> String {
        codec::b64_encode(&self.0)
    }

    /// Encode as lowercase hex
    #[must_use]
    pub fn to_hex(&self) -> String {
        codec::hex_encode(&self.0)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(pk: X25519PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        PublicKey::from(X25519PublicKey::from(secret))
    }
}

/// X25519 secret key with automatic zeroization
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(StaticSecret::random_from_rng(rng))
    }

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Get raw bytes (for persistence through secure storage only)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Get the corresponding public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.0)
    }

    /// Perform Diffie-Hellman key agreement
    #[must_use]
    pub fn diffie_hellman(&self, public: &PublicKey) -> DhOutput {
        let shared = self.0.diffie_hellman(&public.to_x25519());
        DhOutput(*shared.as_bytes())
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self(StaticSecret::from(self.0.to_bytes()))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Output of a Diffie-Hellman operation (32 bytes), zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput([u8; 32]);

impl DhOutput {
    /// Returns the raw shared-secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// Ed25519 identity public key (32 bytes)
///
/// Travels as lowercase hex on the wire and in session keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityPublic([u8; 32]);

impl IdentityPublic {
    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from lowercase hex
    pub fn from_hex(value: &str) -> Result<Self> {
        Ok(Self(codec::as_array(&codec::hex_decode(value)?)?))
    }

    /// Encode as lowercase hex
    #[must_use]
    pub fn to_hex(&self) -> String {
        codec::hex_encode(&self.0)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to Montgomery form for key agreement
    ///
    /// Fails when the bytes do not decode to a valid Edwards point.
    pub fn to_x25519(&self) -> Result<PublicKey> {
        let verifying =
            VerifyingKey::from_bytes(&self.0).map_err(|_| Error::Malformed("invalid identity key"))?;
        Ok(PublicKey::from_bytes(verifying.to_montgomery().to_bytes()))
    }
}

impl std::fmt::Debug for IdentityPublic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityPublic({})", self.to_hex())
    }
}

/// Ed25519 identity secret, held only for the duration of a call
///
/// The core receives the 32-byte seed from the account keystore and never
/// persists or caches it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IdentitySecret([u8; 32]);

impl IdentitySecret {
    /// Wrap a 32-byte Ed25519 seed
    #[must_use]
    pub fn from_bytes(seed: [u8; 32]) -> Self {
        Self(seed)
    }

    /// Generate a fresh identity (test and onboarding use)
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self(seed)
    }

    /// The corresponding Ed25519 public key
    #[must_use]
    pub fn public(&self) -> IdentityPublic {
        IdentityPublic(self.signing_key().verifying_key().to_bytes())
    }

    /// Convert the secret half to X25519 for key agreement
    ///
    /// Uses the SHA-512-derived scalar of the Ed25519 key, so the resulting
    /// public key equals the Montgomery form of the Ed25519 public key.
    #[must_use]
    pub fn to_x25519(&self) -> SecretKey {
        SecretKey(StaticSecret::from(self.signing_key().to_scalar_bytes()))
    }

    /// Sign a message with the Ed25519 identity
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key().sign(message).to_bytes()
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.0)
    }
}

impl std::fmt::Debug for IdentitySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentitySecret([REDACTED])")
    }
}

/// Verify an Ed25519 signature over a signed prekey's public bytes
///
/// Returns [`Error::BadPrekeyBundle`] unless `signature` is a valid
/// signature by `identity` over exactly `prekey_public`.
pub fn verify_signed_prekey(
    identity: &IdentityPublic,
    prekey_public: &PublicKey,
    signature: &[u8; 64],
) -> Result<()> {
    let verifying =
        VerifyingKey::from_bytes(identity.as_bytes()).map_err(|_| Error::BadPrekeyBundle)?;
    let sig = Signature::from_bytes(signature);
    verifying
        .verify(prekey_public.as_bytes(), &sig)
        .map_err(|_| Error::BadPrekeyBundle)
}
