//! Prekey lifecycle controller.
//!
//! Runs on the gateway "ready" signal from an unlocked account: makes sure
//! a prekey store exists, the server holds a fresh signed prekey, and the
//! server's one-time prekey pool stays above the replenishment threshold.
//!
//! Re-running is safe: uploading the same signed prekey id twice replaces
//! it in place, and one-time prekey ids come from the store's monotone
//! allocator so uploads never reuse an id.

use crate::api::{KeysApi, UploadKeysRequest, WireOneTimePrekey, WireSignedPrekey};
use crate::codec;
use crate::error::Result;
use crate::keys::IdentitySecret;
use crate::prekeys::{unix_now_ms, PrekeyStore, OPK_BATCH_SIZE, OPK_LOW_THRESHOLD};
use crate::storage::SecureStorage;
use crate::x3dh::OneTimePrekey;
use rand_core::OsRng;
use tracing::{debug, info};

/// What a maintenance run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// A prekey store was created from scratch
    pub generated_store: bool,
    /// A signed prekey was (re-)uploaded
    pub uploaded_signed_prekey: bool,
    /// Number of one-time prekeys uploaded
    pub uploaded_opks: u64,
}

/// Run prekey maintenance now
pub async fn maintain_prekeys(
    storage: &dyn SecureStorage,
    api: &dyn KeysApi,
    identity: &IdentitySecret,
) -> Result<MaintenanceReport> {
    maintain_prekeys_at(storage, api, identity, unix_now_ms()).await
}

/// Run prekey maintenance against an explicit clock reading
pub async fn maintain_prekeys_at(
    storage: &dyn SecureStorage,
    api: &dyn KeysApi,
    identity: &IdentitySecret,
    now_ms: u64,
) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport::default();

    let mut store = match PrekeyStore::load(storage).await? {
        Some(store) => store,
        None => {
            let store = PrekeyStore::generate(&mut OsRng, now_ms);
            store.save(storage).await?;
            report.generated_store = true;
            info!(opks = store.opk_count(), "generated local prekey store");
            store
        }
    };

    let counts = api.key_counts().await?;
    let mut request = UploadKeysRequest::default();

    if !counts.signed_prekey_uploaded || store.needs_rotation(now_ms) {
        if store.needs_rotation(now_ms) {
            store = store.rotate_signed_prekey(&mut OsRng, now_ms);
            store.save(storage).await?;
            info!(id = store.signed_prekey().id, "rotated signed prekey");
        }
        let public = store.signed_prekey_public()?;
        request.signed_prekey = Some(WireSignedPrekey {
            id: store.signed_prekey().id,
            public_key: public.to_b64(),
            signature: codec::b64_encode(&identity.sign(public.as_bytes())),
        });
        report.uploaded_signed_prekey = true;
    }

    if report.generated_store {
        // First run: publish the initial batch generated above.
        request.one_time_prekeys = wire_opks(&store.one_time_prekey_publics()?);
    } else if counts.one_time_prekeys_remaining < OPK_LOW_THRESHOLD {
        let needed = OPK_BATCH_SIZE - counts.one_time_prekeys_remaining;
        let (updated, publics) = store.generate_additional(&mut OsRng, needed)?;
        updated.save(storage).await?;
        debug!(
            remaining = counts.one_time_prekeys_remaining,
            generated = needed,
            "replenishing one-time prekeys"
        );
        request.one_time_prekeys = wire_opks(&publics);
    }
    report.uploaded_opks = request.one_time_prekeys.len() as u64;

    if request.signed_prekey.is_some() || !request.one_time_prekeys.is_empty() {
        let response = api.upload_keys(&request).await?;
        info!(
            stored = response.one_time_prekeys_stored,
            total = response.one_time_prekeys_total,
            "uploaded prekeys"
        );
    }

    Ok(report)
}

fn wire_opks(publics: &[OneTimePrekey]) -> Vec<WireOneTimePrekey> {
    publics
        .iter()
        .map(|opk| WireOneTimePrekey {
            id: opk.id,
            public_key: opk.public_key.to_b64(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryKeyServer;
    use crate::prekeys::SIGNED_PREKEY_MAX_AGE_MS;
    use std::sync::Arc;

    const NOW: u64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_first_run_uploads_everything() {
        let storage = crate::storage::MemoryStorage::new();
        let server = Arc::new(MemoryKeyServer::new());
        let api = server.client("me");
        let identity = IdentitySecret::generate(&mut OsRng);

        let report = maintain_prekeys_at(&storage, &api, &identity, NOW)
            .await
            .unwrap();
        assert!(report.generated_store);
        assert!(report.uploaded_signed_prekey);
        assert_eq!(report.uploaded_opks, OPK_BATCH_SIZE);

        let counts = api.key_counts().await.unwrap();
        assert!(counts.signed_prekey_uploaded);
        assert_eq!(counts.one_time_prekeys_remaining, OPK_BATCH_SIZE);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let storage = crate::storage::MemoryStorage::new();
        let server = Arc::new(MemoryKeyServer::new());
        let api = server.client("me");
        let identity = IdentitySecret::generate(&mut OsRng);

        maintain_prekeys_at(&storage, &api, &identity, NOW)
            .await
            .unwrap();
        let report = maintain_prekeys_at(&storage, &api, &identity, NOW + 1)
            .await
            .unwrap();

        assert_eq!(report, MaintenanceReport::default());
    }

    #[tokio::test]
    async fn test_replenishes_below_threshold() {
        let storage = crate::storage::MemoryStorage::new();
        let server = Arc::new(MemoryKeyServer::new());
        let api = server.client("me");
        let identity = IdentitySecret::generate(&mut OsRng);

        maintain_prekeys_at(&storage, &api, &identity, NOW)
            .await
            .unwrap();

        // Drain the server pool below the threshold.
        let fetcher = server.client("someone-else");
        for _ in 0..40 {
            fetcher.fetch_prekey_bundle("me").await.unwrap();
        }
        assert_eq!(server.opk_count("me").await, 10);

        let report = maintain_prekeys_at(&storage, &api, &identity, NOW + 2)
            .await
            .unwrap();
        assert!(!report.uploaded_signed_prekey);
        assert_eq!(report.uploaded_opks, OPK_BATCH_SIZE - 10);
        assert_eq!(server.opk_count("me").await, OPK_BATCH_SIZE as usize);
    }

    #[tokio::test]
    async fn test_rotates_aged_signed_prekey() {
        let storage = crate::storage::MemoryStorage::new();
        let server = Arc::new(MemoryKeyServer::new());
        let api = server.client("me");
        let identity = IdentitySecret::generate(&mut OsRng);

        maintain_prekeys_at(&storage, &api, &identity, NOW)
            .await
            .unwrap();
        let before = PrekeyStore::load(&storage).await.unwrap().unwrap();

        let later = NOW + SIGNED_PREKEY_MAX_AGE_MS + 1;
        let report = maintain_prekeys_at(&storage, &api, &identity, later)
            .await
            .unwrap();
        assert!(report.uploaded_signed_prekey);

        let after = PrekeyStore::load(&storage).await.unwrap().unwrap();
        assert_ne!(after.signed_prekey().id, before.signed_prekey().id);
        assert_eq!(after.signed_prekey().created_at, later);
    }
}
