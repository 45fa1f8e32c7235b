//! X3DH (Extended Triple Diffie-Hellman) key agreement.
//!
//! Establishes the initial shared secret between two accounts. The responder
//! publishes a prekey bundle through the keys API; the initiator uses it to
//! derive a shared secret and attaches its identity and ephemeral keys to
//! the first ciphertext so the responder can derive the same secret.
//!
//! Reference: <https://signal.org/docs/specifications/x3dh/>
//!
//! DH order is part of the wire contract:
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)   [only when the bundle carries an OPK]
//! SK  = x3dh_kdf(DH1 || DH2 || DH3 [|| DH4])
//! ```

use crate::crypto::{x3dh_kdf, SymmetricKey};
use crate::error::Result;
use crate::keys::{verify_signed_prekey, IdentityPublic, IdentitySecret, PublicKey, SecretKey};
use rand_core::CryptoRngCore;

/// A peer's signed prekey as published in their bundle
#[derive(Debug, Clone)]
pub struct SignedPrekey {
    /// Server-side prekey id
    pub id: u64,
    /// X25519 public key
    pub public_key: PublicKey,
    /// Ed25519 signature over `public_key` by the peer's identity
    pub signature: [u8; 64],
}

/// A peer's one-time prekey as published in their bundle
#[derive(Debug, Clone, Copy)]
pub struct OneTimePrekey {
    /// Server-side prekey id
    pub id: u64,
    /// X25519 public key
    pub public_key: PublicKey,
}

/// A peer's prekey bundle fetched from the keys API
#[derive(Debug, Clone)]
pub struct PrekeyBundle {
    /// The peer's long-term Ed25519 identity key
    pub identity_key: IdentityPublic,
    /// Medium-lived signed prekey
    pub signed_prekey: SignedPrekey,
    /// Optional one-time prekey, consumed by this handshake
    pub one_time_prekey: Option<OneTimePrekey>,
}

/// Initiator's X3DH outcome
pub struct InitiateOutcome {
    /// 32-byte shared secret, identical to the responder's derivation
    pub shared_secret: SymmetricKey,
    /// Ephemeral public key to attach to the first ciphertext
    pub ephemeral_public: PublicKey,
    /// Id of the one-time prekey consumed from the bundle, if any
    pub used_opk_id: Option<u64>,
}

impl std::fmt::Debug for InitiateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiateOutcome")
            .field("ephemeral_public", &self.ephemeral_public)
            .field("used_opk_id", &self.used_opk_id)
            .finish()
    }
}

/// Initiator side of the handshake
///
/// Verifies the signed prekey signature before any DH is computed; a bad
/// signature rejects the whole bundle.
pub fn initiate<R: CryptoRngCore>(
    rng: &mut R,
    my_identity: &IdentitySecret,
    bundle: &PrekeyBundle,
) -> Result<InitiateOutcome> {
    verify_signed_prekey(
        &bundle.identity_key,
        &bundle.signed_prekey.public_key,
        &bundle.signed_prekey.signature,
    )?;

    let my_identity_x = my_identity.to_x25519();
    let peer_identity_x = bundle.identity_key.to_x25519()?;
    let ephemeral = SecretKey::generate(rng);

    let dh1 = my_identity_x.diffie_hellman(&bundle.signed_prekey.public_key);
    let dh2 = ephemeral.diffie_hellman(&peer_identity_x);
    let dh3 = ephemeral.diffie_hellman(&bundle.signed_prekey.public_key);
    let dh4 = bundle
        .one_time_prekey
        .as_ref()
        .map(|opk| ephemeral.diffie_hellman(&opk.public_key));

    let shared_secret = match &dh4 {
        Some(dh4) => x3dh_kdf(&[&dh1, &dh2, &dh3, dh4]),
        None => x3dh_kdf(&[&dh1, &dh2, &dh3]),
    };

    Ok(InitiateOutcome {
        shared_secret,
        ephemeral_public: ephemeral.public_key(),
        used_opk_id: bundle.one_time_prekey.map(|opk| opk.id),
    })
}

/// Responder side of the handshake
///
/// Mirrors the initiator's DH computations with the private halves of the
/// published prekeys. `my_opk_secret` must be the private key matching the
/// `opk_id` the initiator reported, already removed from the prekey store.
pub fn respond(
    my_identity: &IdentitySecret,
    my_spk_secret: &SecretKey,
    my_opk_secret: Option<&SecretKey>,
    peer_identity: &IdentityPublic,
    peer_ephemeral: &PublicKey,
) -> Result<SymmetricKey> {
    let my_identity_x = my_identity.to_x25519();
    let peer_identity_x = peer_identity.to_x25519()?;

    let dh1 = my_spk_secret.diffie_hellman(&peer_identity_x);
    let dh2 = my_identity_x.diffie_hellman(peer_ephemeral);
    let dh3 = my_spk_secret.diffie_hellman(peer_ephemeral);
    let dh4 = my_opk_secret.map(|opk| opk.diffie_hellman(peer_ephemeral));

    Ok(match &dh4 {
        Some(dh4) => x3dh_kdf(&[&dh1, &dh2, &dh3, dh4]),
        None => x3dh_kdf(&[&dh1, &dh2, &dh3]),
    })
}
