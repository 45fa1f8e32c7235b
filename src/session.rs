//! Session identity and persistence.
//!
//! A session is keyed by the sorted pair of the two accounts' hex-encoded
//! Ed25519 identity keys, so both peers independently derive the same
//! storage key. The serialized record uses base64 for all binary fields and
//! flattens the skipped-key map to `"<dh_hex>:<counter>"` composite keys.

use crate::codec;
use crate::error::{Error, Result};
use crate::keys::{IdentityPublic, PublicKey, SecretKey};
use crate::ratchet::RatchetState;
use crate::storage::SecureStorage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Storage key prefix for ratchet sessions
pub const SESSION_KEY_PREFIX: &str = "signal:session:";

/// Deterministic storage key for the `(a, b)` peer pair
///
/// Both orderings of the arguments yield the same key.
#[must_use]
pub fn session_storage_key(a: &IdentityPublic, b: &IdentityPublic) -> String {
    let mut pair = [a.to_hex(), b.to_hex()];
    pair.sort();
    format!("{SESSION_KEY_PREFIX}{}:{}", pair[0], pair[1])
}

/// Serialized form of a ratchet session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    dhs: String,
    dhr: Option<String>,
    rk: String,
    cks: Option<String>,
    ckr: Option<String>,
    ns: u32,
    nr: u32,
    pn: u32,
    mk_skipped: BTreeMap<String, String>,
}

impl SessionRecord {
    /// Capture a ratchet state into its persistent form
    #[must_use]
    pub fn from_state(state: &RatchetState) -> Self {
        Self {
            dhs: codec::b64_encode(&state.dhs.to_bytes()),
            dhr: state.dhr.map(|pk| pk.to_b64()),
            rk: codec::b64_encode(state.rk.as_bytes()),
            cks: state.cks.as_ref().map(|ck| codec::b64_encode(ck.as_bytes())),
            ckr: state.ckr.as_ref().map(|ck| codec::b64_encode(ck.as_bytes())),
            ns: state.ns,
            nr: state.nr,
            pn: state.pn,
            mk_skipped: state
                .skipped
                .iter()
                .map(|((dh, n), mk)| {
                    (
                        format!("{}:{n}", dh.to_hex()),
                        codec::b64_encode(mk.as_bytes()),
                    )
                })
                .collect(),
        }
    }

    /// Rebuild the ratchet state from its persistent form
    pub fn to_state(&self) -> Result<RatchetState> {
        let mut skipped = std::collections::HashMap::with_capacity(self.mk_skipped.len());
        for (composite, mk) in &self.mk_skipped {
            let (dh_hex, counter) = composite
                .rsplit_once(':')
                .ok_or(Error::Malformed("invalid skipped-key entry"))?;
            let counter: u32 = counter
                .parse()
                .map_err(|_| Error::Malformed("invalid skipped-key counter"))?;
            let dh = PublicKey::from_bytes(codec::as_array(&codec::hex_decode(dh_hex)?)?);
            skipped.insert((dh, counter), decode_key(mk)?);
        }

        Ok(RatchetState {
            dhs: SecretKey::from_bytes(codec::as_array(&codec::b64_decode(&self.dhs)?)?),
            dhr: self.dhr.as_deref().map(PublicKey::from_b64).transpose()?,
            rk: decode_key(&self.rk)?,
            cks: self.cks.as_deref().map(decode_key).transpose()?,
            ckr: self.ckr.as_deref().map(decode_key).transpose()?,
            ns: self.ns,
            nr: self.nr,
            pn: self.pn,
            skipped,
        })
    }
}

fn decode_key(value: &str) -> Result<crate::crypto::SymmetricKey> {
    Ok(crate::crypto::SymmetricKey::from_bytes(codec::as_array(
        &codec::b64_decode(value)?,
    )?))
}

/// Ratchet sessions persisted through secure storage
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn SecureStorage>,
}

impl SessionStore {
    /// Create a store over the given storage backend
    #[must_use]
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self { storage }
    }

    /// Load the session for a peer pair
    pub async fn load(
        &self,
        a: &IdentityPublic,
        b: &IdentityPublic,
    ) -> Result<Option<RatchetState>> {
        match self.storage.get(&session_storage_key(a, b)).await? {
            Some(raw) => {
                let record: SessionRecord = serde_json::from_str(&raw)
                    .map_err(|_| Error::Malformed("invalid session record"))?;
                Ok(Some(record.to_state()?))
            }
            None => Ok(None),
        }
    }

    /// Persist the session for a peer pair
    pub async fn save(
        &self,
        a: &IdentityPublic,
        b: &IdentityPublic,
        state: &RatchetState,
    ) -> Result<()> {
        let raw = serde_json::to_string(&SessionRecord::from_state(state))
            .expect("session record serializes to JSON");
        self.storage.set(&session_storage_key(a, b), &raw).await
    }

    /// Remove the session for a peer pair
    pub async fn delete(&self, a: &IdentityPublic, b: &IdentityPublic) -> Result<()> {
        self.storage.delete(&session_storage_key(a, b)).await
    }

    /// Whether a session exists for a peer pair
    pub async fn has_session(&self, a: &IdentityPublic, b: &IdentityPublic) -> Result<bool> {
        Ok(self
            .storage
            .get(&session_storage_key(a, b))
            .await?
            .is_some())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}
