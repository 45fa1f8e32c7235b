//! Double Ratchet state machine.
//!
//! Combines the per-message symmetric-key ratchet with the Diffie-Hellman
//! ratchet that advances whenever the conversation changes direction,
//! giving forward secrecy and post-compromise security.
//!
//! State is a value: [`RatchetState::encrypt`] and [`RatchetState::decrypt`]
//! leave `self` untouched and return the successor state alongside their
//! output. Callers persist the successor only after the operation succeeds,
//! so a failed or abandoned operation can never leak a half-stepped ratchet
//! into storage.

use crate::crypto::{kdf_ck, kdf_rk, open, random_nonce, seal, SymmetricKey, NONCE_SIZE};
use crate::envelope::{BootstrapKeys, MessageHeader};
use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};
use rand_core::CryptoRngCore;
use std::collections::HashMap;

/// Skipped-message-key budget per decrypt call
pub const MAX_SKIP: u32 = 256;

/// Output of a ratchet encryption
#[derive(Debug, Clone)]
pub struct SealedMessage {
    /// Canonical-JSON header; also the AEAD associated data
    pub header: String,
    /// Fresh random AEAD nonce
    pub nonce: [u8; NONCE_SIZE],
    /// AEAD ciphertext
    pub ciphertext: Vec<u8>,
}

/// Per-peer Double Ratchet session state
#[derive(Clone)]
pub struct RatchetState {
    /// Our current sending ratchet keypair
    pub(crate) dhs: SecretKey,
    /// Peer's current ratchet public key; None until the responder's first receive
    pub(crate) dhr: Option<PublicKey>,
    /// Root key
    pub(crate) rk: SymmetricKey,
    /// Sending chain key; None for a responder that has not yet received
    pub(crate) cks: Option<SymmetricKey>,
    /// Receiving chain key
    pub(crate) ckr: Option<SymmetricKey>,
    /// Messages sent in the current sending chain
    pub(crate) ns: u32,
    /// Messages received in the current receiving chain
    pub(crate) nr: u32,
    /// Length of the previous sending chain
    pub(crate) pn: u32,
    /// Cached keys for not-yet-received messages, by (ratchet key, counter)
    pub(crate) skipped: HashMap<(PublicKey, u32), SymmetricKey>,
}

impl RatchetState {
    /// Initialize as the X3DH initiator
    ///
    /// Performs the first half-step of the DH ratchet immediately: the
    /// initiator can send before the peer ever comes online.
    pub fn init_initiator<R: CryptoRngCore>(
        rng: &mut R,
        shared_secret: SymmetricKey,
        peer_signed_prekey: PublicKey,
    ) -> Self {
        let dhs = SecretKey::generate(rng);
        let dh_out = dhs.diffie_hellman(&peer_signed_prekey);
        let (rk, cks) = kdf_rk(&shared_secret, &dh_out);

        Self {
            dhs,
            dhr: Some(peer_signed_prekey),
            rk,
            cks: Some(cks),
            ckr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: HashMap::new(),
        }
    }

    /// Initialize as the X3DH responder
    ///
    /// The responder's first ratchet keypair is its signed prekey; it cannot
    /// send until the initiator's first message arrives and completes the
    /// DH ratchet.
    #[must_use]
    pub fn init_responder(shared_secret: SymmetricKey, signed_prekey: SecretKey) -> Self {
        Self {
            dhs: signed_prekey,
            dhr: None,
            rk: shared_secret,
            cks: None,
            ckr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: HashMap::new(),
        }
    }

    /// Peer's current ratchet public key, if one has been observed
    #[must_use]
    pub fn remote_ratchet_key(&self) -> Option<PublicKey> {
        self.dhr
    }

    /// Number of cached skipped-message keys
    #[must_use]
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt a message, returning the sealed output and the successor state
    ///
    /// `bootstrap` attaches X3DH material to the header on a session's first
    /// ciphertext; the AEAD binds it along with the ratchet fields.
    pub fn encrypt<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
        bootstrap: Option<&BootstrapKeys>,
    ) -> Result<(SealedMessage, RatchetState)> {
        let cks = self.cks.as_ref().ok_or(Error::SendingChainNotInitialized)?;
        let (next_cks, message_key) = kdf_ck(cks);

        let header = MessageHeader {
            dh: self.dhs.public_key().to_b64(),
            pn: self.pn,
            n: self.ns,
            ik: bootstrap.map(|b| b.identity_key.clone()),
            ek: bootstrap.map(|b| b.ephemeral_key.clone()),
            opk_id: bootstrap.and_then(|b| b.opk_id),
        };
        let header_json = header.to_canonical_json();

        let nonce = random_nonce(rng);
        let ciphertext = seal(&message_key, &nonce, plaintext, header_json.as_bytes())?;

        let mut next = self.clone();
        next.cks = Some(next_cks);
        next.ns += 1;

        Ok((
            SealedMessage {
                header: header_json,
                nonce,
                ciphertext,
            },
            next,
        ))
    }

    /// Decrypt a message, returning the plaintext and the successor state
    ///
    /// `header_raw` must be the header string exactly as received; it is the
    /// AEAD associated data, so any re-serialization would break
    /// authentication.
    pub fn decrypt<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        header: &MessageHeader,
        header_raw: &[u8],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<(Vec<u8>, RatchetState)> {
        let message_dh = PublicKey::from_b64(&header.dh)?;

        // Out-of-order fast path: a key cached for this exact message.
        if let Some(message_key) = self.skipped.get(&(message_dh, header.n)) {
            let plaintext = open(message_key, nonce, ciphertext, header_raw)?;
            let mut next = self.clone();
            next.skipped.remove(&(message_dh, header.n));
            return Ok((plaintext, next));
        }

        let mut next = self.clone();
        let mut skip_budget = MAX_SKIP;

        if Some(message_dh) != next.dhr {
            // Close out the current receiving chain, caching keys for the
            // messages still in flight, then step the DH ratchet.
            if next.ckr.is_some() {
                skip_to(&mut next, header.pn, &mut skip_budget)?;
            }
            dh_ratchet(&mut next, rng, message_dh);
        }

        skip_to(&mut next, header.n, &mut skip_budget)?;

        let ckr = next.ckr.as_ref().ok_or(Error::DecryptFailed)?;
        let (next_ckr, message_key) = kdf_ck(ckr);
        let plaintext = open(&message_key, nonce, ciphertext, header_raw)?;

        next.ckr = Some(next_ckr);
        next.nr += 1;

        Ok((plaintext, next))
    }
}

/// Advance the receiving chain to `until`, caching each derived message key
fn skip_to(state: &mut RatchetState, until: u32, budget: &mut u32) -> Result<()> {
    if until < state.nr {
        // Counter behind the chain with no cached key: replayed or forged.
        return Err(Error::DecryptFailed);
    }

    let gap = until - state.nr;
    if gap > *budget {
        return Err(Error::TooManySkipped);
    }
    *budget -= gap;

    if gap == 0 {
        return Ok(());
    }

    let dhr = state.dhr.ok_or(Error::DecryptFailed)?;
    let mut chain = state.ckr.clone().ok_or(Error::DecryptFailed)?;

    for i in state.nr..until {
        let (next_chain, message_key) = kdf_ck(&chain);
        state.skipped.insert((dhr, i), message_key);
        chain = next_chain;
    }

    state.ckr = Some(chain);
    state.nr = until;
    Ok(())
}

/// DH ratchet step on observing a new remote ratchet key
fn dh_ratchet<R: CryptoRngCore>(state: &mut RatchetState, rng: &mut R, message_dh: PublicKey) {
    state.pn = state.ns;
    state.ns = 0;
    state.nr = 0;
    state.dhr = Some(message_dh);

    let dh_recv = state.dhs.diffie_hellman(&message_dh);
    let (rk, ckr) = kdf_rk(&state.rk, &dh_recv);

    state.dhs = SecretKey::generate(rng);
    let dh_send = state.dhs.diffie_hellman(&message_dh);
    let (rk, cks) = kdf_rk(&rk, &dh_send);

    state.rk = rk;
    state.ckr = Some(ckr);
    state.cks = Some(cks);
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("ns", &self.ns)
            .field("nr", &self.nr)
            .field("pn", &self.pn)
            .field("skipped", &self.skipped.len())
            .finish()
    }
}
