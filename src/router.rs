//! The v1/v2 envelope router.
//!
//! [`DmCipher`] is the entry point the message layer calls. It owns routing
//! between the legacy static-ECDH path (v1, for peers that never published
//! prekeys) and the ratchet path (v2), including X3DH initiation metadata,
//! responder bootstrap, and the single bootstrap retry after an
//! authenticated decryption failure.
//!
//! Operations on one peer pair are serialized by a per-pair mutex; the
//! updated session is persisted before the lock is released, so an encrypt
//! that observed state S is externally ordered before any later load.

use crate::api::KeysApi;
use crate::codec;
use crate::crypto::{open, random_nonce, seal, SymmetricKey, NONCE_SIZE};
use crate::envelope::{BootstrapKeys, Envelope, MessageHeader, VERSION_V1, VERSION_V2};
use crate::error::{Error, Result};
use crate::keys::{IdentityPublic, IdentitySecret, PublicKey};
use crate::prekeys::PrekeyStore;
use crate::ratchet::{RatchetState, SealedMessage};
use crate::session::{session_storage_key, SessionStore};
use crate::storage::SecureStorage;
use crate::x3dh;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Domain-separation context for the legacy channel-scoped key
const V1_KEY_CONTEXT: &str = "paracord:dm-e2ee:v1:";

/// Encrypts and decrypts direct messages, routing between payload versions
pub struct DmCipher {
    sessions: SessionStore,
    storage: Arc<dyn SecureStorage>,
    api: Arc<dyn KeysApi>,
    pair_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DmCipher {
    /// Create a router over the given storage and keys API
    #[must_use]
    pub fn new(storage: Arc<dyn SecureStorage>, api: Arc<dyn KeysApi>) -> Self {
        Self {
            sessions: SessionStore::new(Arc::clone(&storage)),
            storage,
            api,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a ratchet session exists with the peer
    pub async fn has_session(
        &self,
        identity: &IdentityPublic,
        peer: &IdentityPublic,
    ) -> Result<bool> {
        self.sessions.has_session(identity, peer).await
    }

    /// Drop the ratchet session with the peer, forcing a re-bootstrap
    pub async fn reset_session(
        &self,
        identity: &IdentityPublic,
        peer: &IdentityPublic,
    ) -> Result<()> {
        let _guard = self.pair_lock(identity, peer).await;
        self.sessions.delete(identity, peer).await
    }

    /// Encrypt a direct message for a peer
    ///
    /// Prefers an existing ratchet session; otherwise initiates X3DH when a
    /// bundle can be fetched for `peer_user_id`; otherwise falls back to the
    /// legacy channel-scoped path.
    pub async fn encrypt_dm(
        &self,
        channel_id: &str,
        plaintext: &[u8],
        identity: &IdentitySecret,
        peer: &IdentityPublic,
        peer_user_id: Option<&str>,
    ) -> Result<Envelope> {
        let me = identity.public();
        let _guard = self.pair_lock(&me, peer).await;

        if let Some(state) = self.sessions.load(&me, peer).await? {
            let (sealed, next) = state.encrypt(&mut OsRng, plaintext, None)?;
            self.sessions.save(&me, peer, &next).await?;
            return Ok(v2_envelope(sealed));
        }

        if let Some(user_id) = peer_user_id {
            if let Some(wire) = self.api.fetch_prekey_bundle(user_id).await? {
                let bundle = wire.to_bundle()?;
                let outcome = x3dh::initiate(&mut OsRng, identity, &bundle)?;
                debug!(used_opk = ?outcome.used_opk_id, "initiating ratchet session");

                let state = RatchetState::init_initiator(
                    &mut OsRng,
                    outcome.shared_secret,
                    bundle.signed_prekey.public_key,
                );
                let bootstrap = BootstrapKeys {
                    identity_key: me.to_hex(),
                    ephemeral_key: outcome.ephemeral_public.to_b64(),
                    opk_id: outcome.used_opk_id,
                };
                let (sealed, next) = state.encrypt(&mut OsRng, plaintext, Some(&bootstrap))?;
                self.sessions.save(&me, peer, &next).await?;
                return Ok(v2_envelope(sealed));
            }
        }

        debug!("no session and no peer bundle, using legacy envelope");
        self.v1_encrypt(channel_id, plaintext, identity, peer)
    }

    /// Decrypt a direct message from a peer
    pub async fn decrypt_dm(
        &self,
        channel_id: &str,
        envelope: &Envelope,
        identity: &IdentitySecret,
        peer: &IdentityPublic,
    ) -> Result<Vec<u8>> {
        if envelope.version != VERSION_V1 && envelope.version != VERSION_V2 {
            return Err(Error::UnsupportedVersion(envelope.version));
        }

        let nonce: [u8; NONCE_SIZE] = codec::as_array(&codec::b64_decode(&envelope.nonce)?)?;
        let ciphertext = codec::b64_decode(&envelope.ciphertext)?;

        let Some(header_raw) = envelope
            .header
            .as_deref()
            .filter(|_| envelope.version == VERSION_V2)
        else {
            return self.v1_decrypt(channel_id, &nonce, &ciphertext, identity, peer);
        };

        let header = MessageHeader::parse(header_raw)?;
        let me = identity.public();
        let _guard = self.pair_lock(&me, peer).await;

        match self.sessions.load(&me, peer).await? {
            Some(state) => {
                let attempt = state.decrypt(
                    &mut OsRng,
                    &header,
                    header_raw.as_bytes(),
                    &nonce,
                    &ciphertext,
                );
                match attempt {
                    Ok((plaintext, next)) => {
                        self.sessions.save(&me, peer, &next).await?;
                        Ok(plaintext)
                    }
                    Err(Error::DecryptFailed) if header.has_bootstrap() => {
                        // The peer restarted the handshake; our session is
                        // stale. Rebuild from the bootstrap material, once.
                        warn!("session undecipherable, retrying responder bootstrap");
                        self.sessions.delete(&me, peer).await?;
                        self.bootstrap_and_decrypt(
                            &me,
                            peer,
                            identity,
                            &header,
                            header_raw,
                            &nonce,
                            &ciphertext,
                        )
                        .await
                    }
                    Err(err) => Err(err),
                }
            }
            None if header.has_bootstrap() => {
                self.bootstrap_and_decrypt(
                    &me,
                    peer,
                    identity,
                    &header,
                    header_raw,
                    &nonce,
                    &ciphertext,
                )
                .await
            }
            None => Err(Error::NoSession),
        }
    }

    /// Responder-side X3DH from a header's bootstrap material
    #[allow(clippy::too_many_arguments)]
    async fn bootstrap_and_decrypt(
        &self,
        me: &IdentityPublic,
        peer: &IdentityPublic,
        identity: &IdentitySecret,
        header: &MessageHeader,
        header_raw: &str,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let store = PrekeyStore::load(self.storage.as_ref())
            .await?
            .ok_or(Error::NoPrekeyStore)?;

        let peer_identity = match &header.ik {
            Some(ik) => IdentityPublic::from_hex(ik)?,
            None => return Err(Error::NoSession),
        };
        let peer_ephemeral = match &header.ek {
            Some(ek) => PublicKey::from_b64(ek)?,
            None => return Err(Error::NoSession),
        };

        // Consume the one-time prekey and persist the shrunken store before
        // any decryption: the key must never be handed out twice, even if
        // this operation is abandoned.
        let mut opk_secret = None;
        if let Some(opk_id) = header.opk_id {
            if let Some((secret, updated)) = store.consume(opk_id)? {
                updated.save(self.storage.as_ref()).await?;
                opk_secret = Some(secret);
            } else {
                debug!(opk_id, "one-time prekey already consumed");
            }
        }

        let spk_secret = store.signed_prekey_secret()?;
        let shared_secret = x3dh::respond(
            identity,
            &spk_secret,
            opk_secret.as_ref(),
            &peer_identity,
            &peer_ephemeral,
        )?;

        let state = RatchetState::init_responder(shared_secret, spk_secret);
        let (plaintext, next) =
            state.decrypt(&mut OsRng, header, header_raw.as_bytes(), nonce, ciphertext)?;
        self.sessions.save(me, peer, &next).await?;
        Ok(plaintext)
    }

    /// Legacy path: deterministic channel-scoped key from static ECDH
    fn v1_key(
        &self,
        channel_id: &str,
        identity: &IdentitySecret,
        peer: &IdentityPublic,
    ) -> Result<SymmetricKey> {
        let dh = identity.to_x25519().diffie_hellman(&peer.to_x25519()?);
        let mut hasher = Sha256::new();
        hasher.update(V1_KEY_CONTEXT.as_bytes());
        hasher.update(channel_id.as_bytes());
        hasher.update(dh.as_bytes());
        Ok(SymmetricKey::from_bytes(hasher.finalize().into()))
    }

    fn v1_encrypt(
        &self,
        channel_id: &str,
        plaintext: &[u8],
        identity: &IdentitySecret,
        peer: &IdentityPublic,
    ) -> Result<Envelope> {
        let key = self.v1_key(channel_id, identity, peer)?;
        let nonce = random_nonce(&mut OsRng);
        let ciphertext = seal(&key, &nonce, plaintext, b"")?;

        Ok(Envelope {
            version: VERSION_V1,
            nonce: codec::b64_encode(&nonce),
            ciphertext: codec::b64_encode(&ciphertext),
            header: None,
        })
    }

    fn v1_decrypt(
        &self,
        channel_id: &str,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        identity: &IdentitySecret,
        peer: &IdentityPublic,
    ) -> Result<Vec<u8>> {
        let key = self.v1_key(channel_id, identity, peer)?;
        open(&key, nonce, ciphertext, b"")
    }

    /// Serialize operations per peer pair
    async fn pair_lock(&self, me: &IdentityPublic, peer: &IdentityPublic) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.pair_locks.lock().await;
            Arc::clone(
                locks
                    .entry(session_storage_key(me, peer))
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

impl std::fmt::Debug for DmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmCipher").finish_non_exhaustive()
    }
}

fn v2_envelope(sealed: SealedMessage) -> Envelope {
    Envelope {
        version: VERSION_V2,
        nonce: codec::b64_encode(&sealed.nonce),
        ciphertext: codec::b64_encode(&sealed.ciphertext),
        header: Some(sealed.header),
    }
}
