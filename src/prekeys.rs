//! Local prekey store.
//!
//! Holds the account's signed prekey and one-time prekey pool, persisted as
//! JSON through secure storage under `signal:prekeys`. Key ids come from a
//! single monotone allocator seeded with the unix-epoch milliseconds at
//! first generation, so signed and one-time prekeys never collide and ids
//! are never reused across the store's lifetime.
//!
//! The store is a value: mutating operations return an updated copy which
//! the caller persists. A one-time prekey private key leaves the store at
//! most once.

use crate::codec;
use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};
use crate::storage::SecureStorage;
use crate::x3dh::OneTimePrekey;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One-time prekeys generated per batch
pub const OPK_BATCH_SIZE: u64 = 50;

/// Server pool level that triggers replenishment
pub const OPK_LOW_THRESHOLD: u64 = 20;

/// Signed prekey lifetime before rotation (7 days)
pub const SIGNED_PREKEY_MAX_AGE_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Storage key for the serialized prekey store
pub const PREKEY_STORAGE_KEY: &str = "signal:prekeys";

/// Current unix-epoch milliseconds
#[must_use]
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Persisted signed prekey entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignedPrekey {
    /// Prekey id from the shared allocator
    pub id: u64,
    /// X25519 public key, base64
    pub public_key: String,
    private_key: String,
    /// Creation time, unix-epoch milliseconds
    pub created_at: u64,
}

/// Persisted one-time prekey entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredOneTimePrekey {
    /// Prekey id from the shared allocator
    pub id: u64,
    /// X25519 public key, base64
    pub public_key: String,
    private_key: String,
}

/// The account's local prekey material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyStore {
    signed_prekey: StoredSignedPrekey,
    one_time_prekeys: Vec<StoredOneTimePrekey>,
    next_key_id: u64,
}

fn stored_opk<R: CryptoRngCore>(rng: &mut R, id: u64) -> StoredOneTimePrekey {
    let secret = SecretKey::generate(rng);
    StoredOneTimePrekey {
        id,
        public_key: secret.public_key().to_b64(),
        private_key: codec::b64_encode(&secret.to_bytes()),
    }
}

impl PrekeyStore {
    /// Generate a fresh store: one signed prekey and a full OPK batch
    pub fn generate<R: CryptoRngCore>(rng: &mut R, now_ms: u64) -> Self {
        let mut next_key_id = now_ms;
        let mut alloc = || {
            let id = next_key_id;
            next_key_id += 1;
            id
        };

        let signed_secret = SecretKey::generate(rng);
        let signed_prekey = StoredSignedPrekey {
            id: alloc(),
            public_key: signed_secret.public_key().to_b64(),
            private_key: codec::b64_encode(&signed_secret.to_bytes()),
            created_at: now_ms,
        };

        let one_time_prekeys = (0..OPK_BATCH_SIZE).map(|_| stored_opk(rng, alloc())).collect();

        Self {
            signed_prekey,
            one_time_prekeys,
            next_key_id,
        }
    }

    /// The current signed prekey entry
    #[must_use]
    pub fn signed_prekey(&self) -> &StoredSignedPrekey {
        &self.signed_prekey
    }

    /// Decode the signed prekey's private half for X3DH responses
    pub fn signed_prekey_secret(&self) -> Result<SecretKey> {
        decode_secret(&self.signed_prekey.private_key)
    }

    /// Decode the signed prekey's public half
    pub fn signed_prekey_public(&self) -> Result<PublicKey> {
        PublicKey::from_b64(&self.signed_prekey.public_key)
    }

    /// Number of one-time prekeys still held locally
    #[must_use]
    pub fn opk_count(&self) -> usize {
        self.one_time_prekeys.len()
    }

    /// Public halves of every held one-time prekey, for the initial upload
    pub fn one_time_prekey_publics(&self) -> Result<Vec<OneTimePrekey>> {
        self.one_time_prekeys
            .iter()
            .map(|opk| {
                Ok(OneTimePrekey {
                    id: opk.id,
                    public_key: PublicKey::from_b64(&opk.public_key)?,
                })
            })
            .collect()
    }

    /// Whether the signed prekey has outlived its rotation window
    #[must_use]
    pub fn needs_rotation(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.signed_prekey.created_at) > SIGNED_PREKEY_MAX_AGE_MS
    }

    /// Replace the signed prekey with a fresh pair
    ///
    /// The old private key is dropped; in-flight handshakes against the old
    /// prekey fail and re-bootstrap, which is the accepted rotation cost.
    pub fn rotate_signed_prekey<R: CryptoRngCore>(&self, rng: &mut R, now_ms: u64) -> Self {
        let mut next = self.clone();
        let secret = SecretKey::generate(rng);
        next.signed_prekey = StoredSignedPrekey {
            id: next.next_key_id,
            public_key: secret.public_key().to_b64(),
            private_key: codec::b64_encode(&secret.to_bytes()),
            created_at: now_ms,
        };
        next.next_key_id += 1;
        next
    }

    /// Generate additional one-time prekeys, returning the updated store and
    /// the public halves for upload
    pub fn generate_additional<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        count: u64,
    ) -> Result<(Self, Vec<OneTimePrekey>)> {
        let mut next = self.clone();
        let mut publics = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let opk = stored_opk(rng, next.next_key_id);
            next.next_key_id += 1;
            publics.push(OneTimePrekey {
                id: opk.id,
                public_key: PublicKey::from_b64(&opk.public_key)?,
            });
            next.one_time_prekeys.push(opk);
        }

        Ok((next, publics))
    }

    /// Remove and return a one-time prekey's private half
    ///
    /// Returns `None` when the id is unknown or already consumed. The
    /// returned store no longer contains the key; persisting it before the
    /// key is used guarantees one-shot consumption even across a crash.
    pub fn consume(&self, opk_id: u64) -> Result<Option<(SecretKey, Self)>> {
        let Some(index) = self.one_time_prekeys.iter().position(|opk| opk.id == opk_id) else {
            return Ok(None);
        };

        let mut next = self.clone();
        let entry = next.one_time_prekeys.remove(index);
        Ok(Some((decode_secret(&entry.private_key)?, next)))
    }

    /// Load the store from secure storage
    pub async fn load(storage: &dyn SecureStorage) -> Result<Option<Self>> {
        match storage.get(PREKEY_STORAGE_KEY).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|_| Error::Malformed("invalid prekey store"))?,
            )),
            None => Ok(None),
        }
    }

    /// Persist the store to secure storage
    pub async fn save(&self, storage: &dyn SecureStorage) -> Result<()> {
        let raw = serde_json::to_string(self).expect("prekey store serializes to JSON");
        storage.set(PREKEY_STORAGE_KEY, &raw).await
    }
}

fn decode_secret(value: &str) -> Result<SecretKey> {
    Ok(SecretKey::from_bytes(codec::as_array(&codec::b64_decode(
        value,
    )?)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use rand_core::OsRng;

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn test_generate_allocates_unique_ids() {
        let store = PrekeyStore::generate(&mut OsRng, NOW);
        assert_eq!(store.opk_count(), OPK_BATCH_SIZE as usize);

        let mut ids: Vec<u64> = store.one_time_prekeys.iter().map(|opk| opk.id).collect();
        ids.push(store.signed_prekey.id);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), OPK_BATCH_SIZE as usize + 1);
        assert_eq!(store.signed_prekey.id, NOW);
    }

    #[test]
    fn test_consume_is_one_shot() {
        let store = PrekeyStore::generate(&mut OsRng, NOW);
        let id = store.one_time_prekeys[0].id;

        let (secret, updated) = store.consume(id).unwrap().unwrap();
        assert_eq!(
            secret.public_key().to_b64(),
            store.one_time_prekeys[0].public_key
        );
        assert_eq!(updated.opk_count(), store.opk_count() - 1);
        assert!(updated.consume(id).unwrap().is_none());
    }

    #[test]
    fn test_consume_unknown_id() {
        let store = PrekeyStore::generate(&mut OsRng, NOW);
        assert!(store.consume(u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_rotation_window() {
        let store = PrekeyStore::generate(&mut OsRng, NOW);
        assert!(!store.needs_rotation(NOW));
        assert!(!store.needs_rotation(NOW + SIGNED_PREKEY_MAX_AGE_MS));
        assert!(store.needs_rotation(NOW + SIGNED_PREKEY_MAX_AGE_MS + 1));
    }

    #[test]
    fn test_rotation_replaces_key_and_advances_id() {
        let store = PrekeyStore::generate(&mut OsRng, NOW);
        let rotated = store.rotate_signed_prekey(&mut OsRng, NOW + 1);

        assert_ne!(rotated.signed_prekey.id, store.signed_prekey.id);
        assert_ne!(rotated.signed_prekey.public_key, store.signed_prekey.public_key);
        assert_eq!(rotated.signed_prekey.created_at, NOW + 1);
        assert!(rotated.signed_prekey.id > store.signed_prekey.id);
        // OPK pool untouched by rotation
        assert_eq!(rotated.opk_count(), store.opk_count());
    }

    #[test]
    fn test_generate_additional_never_reuses_ids() {
        let store = PrekeyStore::generate(&mut OsRng, NOW);
        let (updated, publics) = store.generate_additional(&mut OsRng, 10).unwrap();

        assert_eq!(publics.len(), 10);
        assert_eq!(updated.opk_count(), store.opk_count() + 10);

        let mut ids: Vec<u64> = updated.one_time_prekeys.iter().map(|opk| opk.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), updated.opk_count());
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let storage = MemoryStorage::new();
        assert!(PrekeyStore::load(&storage).await.unwrap().is_none());

        let store = PrekeyStore::generate(&mut OsRng, NOW);
        store.save(&storage).await.unwrap();

        let loaded = PrekeyStore::load(&storage).await.unwrap().unwrap();
        assert_eq!(loaded.signed_prekey.id, store.signed_prekey.id);
        assert_eq!(loaded.opk_count(), store.opk_count());
        assert_eq!(loaded.next_key_id, store.next_key_id);
    }
}
