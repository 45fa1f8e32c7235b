//! Keys API capability and wire types.
//!
//! The server stores each account's published prekeys and hands out bundles
//! to initiators. The HTTP client lives outside the core; this module
//! defines the request/response shapes (`PUT /users/@me/keys`,
//! `GET /users/@me/keys/count`, `GET /users/{id}/keys`) and the capability
//! trait the router and prekey controller consume.
//!
//! Public keys and signatures are base64 on the wire; identity keys are
//! lowercase hex. Both representations are contract.

use crate::codec;
use crate::error::Result;
use crate::keys::{IdentityPublic, PublicKey};
use crate::x3dh::{OneTimePrekey, PrekeyBundle, SignedPrekey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Signed prekey as uploaded to and served by the keys API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSignedPrekey {
    /// Prekey id
    pub id: u64,
    /// X25519 public key, base64
    pub public_key: String,
    /// Ed25519 signature over the public key bytes, base64
    pub signature: String,
}

/// One-time prekey as uploaded to and served by the keys API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOneTimePrekey {
    /// Prekey id
    pub id: u64,
    /// X25519 public key, base64
    pub public_key: String,
}

/// Prekey bundle served by `GET /users/{id}/keys`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePrekeyBundle {
    /// Account's Ed25519 identity key, hex
    pub identity_key: String,
    /// Current signed prekey
    pub signed_prekey: WireSignedPrekey,
    /// One one-time prekey, absent when the pool is exhausted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<WireOneTimePrekey>,
}

impl WirePrekeyBundle {
    /// Decode into the domain bundle, validating key encodings
    pub fn to_bundle(&self) -> Result<PrekeyBundle> {
        Ok(PrekeyBundle {
            identity_key: IdentityPublic::from_hex(&self.identity_key)?,
            signed_prekey: SignedPrekey {
                id: self.signed_prekey.id,
                public_key: PublicKey::from_b64(&self.signed_prekey.public_key)?,
                signature: codec::as_array(&codec::b64_decode(&self.signed_prekey.signature)?)?,
            },
            one_time_prekey: self
                .one_time_prekey
                .as_ref()
                .map(|opk| {
                    Ok::<_, crate::error::Error>(OneTimePrekey {
                        id: opk.id,
                        public_key: PublicKey::from_b64(&opk.public_key)?,
                    })
                })
                .transpose()?,
        })
    }
}

/// Body of `PUT /users/@me/keys`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadKeysRequest {
    /// Replacement signed prekey, when rotating or first uploading
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_prekey: Option<WireSignedPrekey>,
    /// Fresh one-time prekeys to add to the server pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_time_prekeys: Vec<WireOneTimePrekey>,
}

/// Response of `PUT /users/@me/keys`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadKeysResponse {
    /// Id of the signed prekey now current on the server
    pub signed_prekey_id: Option<u64>,
    /// Number of one-time prekeys stored by this request
    pub one_time_prekeys_stored: u64,
    /// Total one-time prekeys now held by the server
    pub one_time_prekeys_total: u64,
}

/// Response of `GET /users/@me/keys/count`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCounts {
    /// One-time prekeys still unconsumed on the server
    pub one_time_prekeys_remaining: u64,
    /// Whether a signed prekey is currently published
    pub signed_prekey_uploaded: bool,
}

/// Client capability for the keys API
///
/// Implementations handle transport, auth, and retries. A missing bundle is
/// `Ok(None)`, not an error: the router treats it as a routing signal and
/// falls back to the legacy path.
#[async_trait]
pub trait KeysApi: Send + Sync {
    /// `PUT /users/@me/keys`
    async fn upload_keys(&self, request: &UploadKeysRequest) -> Result<UploadKeysResponse>;

    /// `GET /users/@me/keys/count`
    async fn key_counts(&self) -> Result<KeyCounts>;

    /// `GET /users/{id}/keys`; consumes one OPK from the peer's pool
    async fn fetch_prekey_bundle(&self, user_id: &str) -> Result<Option<WirePrekeyBundle>>;
}

#[derive(Debug, Default)]
struct AccountKeys {
    identity_key: String,
    signed_prekey: Option<WireSignedPrekey>,
    one_time_prekeys: Vec<WireOneTimePrekey>,
}

/// Shared in-memory key server for tests
///
/// Mimics the real server's consumption semantics: each served bundle pops
/// one one-time prekey from the owner's pool.
#[derive(Debug, Default)]
pub struct MemoryKeyServer {
    accounts: std::sync::Arc<Mutex<HashMap<String, AccountKeys>>>,
}

impl MemoryKeyServer {
    /// Create an empty server
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account's identity key so bundles can be served for it
    pub async fn register(&self, user_id: &str, identity: &IdentityPublic) {
        let mut accounts = self.accounts.lock().await;
        accounts.entry(user_id.to_owned()).or_default().identity_key = identity.to_hex();
    }

    /// One-time prekeys currently pooled for an account
    pub async fn opk_count(&self, user_id: &str) -> usize {
        let accounts = self.accounts.lock().await;
        accounts
            .get(user_id)
            .map_or(0, |account| account.one_time_prekeys.len())
    }

    /// Client view of this server for one account
    #[must_use]
    pub fn client(&self, user_id: &str) -> MemoryKeysApi {
        MemoryKeysApi {
            accounts: std::sync::Arc::clone(&self.accounts),
            user_id: user_id.to_owned(),
        }
    }
}

/// Per-account client handle onto a [`MemoryKeyServer`]
#[derive(Debug)]
pub struct MemoryKeysApi {
    accounts: std::sync::Arc<Mutex<HashMap<String, AccountKeys>>>,
    user_id: String,
}

#[async_trait]
impl KeysApi for MemoryKeysApi {
    async fn upload_keys(&self, request: &UploadKeysRequest) -> Result<UploadKeysResponse> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts.entry(self.user_id.clone()).or_default();

        if let Some(signed) = &request.signed_prekey {
            account.signed_prekey = Some(signed.clone());
        }
        account
            .one_time_prekeys
            .extend(request.one_time_prekeys.iter().cloned());

        Ok(UploadKeysResponse {
            signed_prekey_id: account.signed_prekey.as_ref().map(|spk| spk.id),
            one_time_prekeys_stored: request.one_time_prekeys.len() as u64,
            one_time_prekeys_total: account.one_time_prekeys.len() as u64,
        })
    }

    async fn key_counts(&self) -> Result<KeyCounts> {
        let accounts = self.accounts.lock().await;
        let account = accounts.get(&self.user_id);
        Ok(KeyCounts {
            one_time_prekeys_remaining: account
                .map_or(0, |account| account.one_time_prekeys.len() as u64),
            signed_prekey_uploaded: account.is_some_and(|account| account.signed_prekey.is_some()),
        })
    }

    async fn fetch_prekey_bundle(&self, user_id: &str) -> Result<Option<WirePrekeyBundle>> {
        let mut accounts = self.accounts.lock().await;
        let Some(account) = accounts.get_mut(user_id) else {
            return Ok(None);
        };
        let Some(signed_prekey) = account.signed_prekey.clone() else {
            return Ok(None);
        };

        let one_time_prekey = if account.one_time_prekeys.is_empty() {
            None
        } else {
            Some(account.one_time_prekeys.remove(0))
        };

        Ok(Some(WirePrekeyBundle {
            identity_key: account.identity_key.clone(),
            signed_prekey,
            one_time_prekey,
        }))
    }
}
