//! End-to-end flows through the envelope router.
//!
//! Covers the full stack: prekey maintenance publishes Bob's bundle, Alice
//! initiates over it, and both sides converse through [`DmCipher`] with
//! sessions persisted in secure storage between every operation.

use std::sync::Arc;

use paracord_e2ee::api::{KeysApi, MemoryKeyServer};
use paracord_e2ee::envelope::{Envelope, MessageHeader, VERSION_V2};
use paracord_e2ee::error::Error;
use paracord_e2ee::keys::{IdentityPublic, IdentitySecret};
use paracord_e2ee::lifecycle::maintain_prekeys_at;
use paracord_e2ee::prekeys::{PrekeyStore, OPK_BATCH_SIZE};
use paracord_e2ee::ratchet::RatchetState;
use paracord_e2ee::router::DmCipher;
use paracord_e2ee::session::{SessionRecord, SessionStore};
use paracord_e2ee::storage::MemoryStorage;
use rand_core::OsRng;

const NOW: u64 = 1_700_000_000_000;

struct Peer {
    identity: IdentitySecret,
    storage: Arc<MemoryStorage>,
    cipher: DmCipher,
}

impl Peer {
    fn new(server: &Arc<MemoryKeyServer>, user_id: &str) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let cipher = DmCipher::new(storage.clone(), Arc::new(server.client(user_id)));
        Self {
            identity: IdentitySecret::generate(&mut OsRng),
            storage,
            cipher,
        }
    }

    fn public(&self) -> IdentityPublic {
        self.identity.public()
    }

    async fn publish_keys(&self, server: &Arc<MemoryKeyServer>, user_id: &str) {
        server.register(user_id, &self.public()).await;
        maintain_prekeys_at(
            self.storage.as_ref(),
            &server.client(user_id),
            &self.identity,
            NOW,
        )
        .await
        .expect("prekey maintenance should succeed");
    }

    async fn session_with(&self, peer: &IdentityPublic) -> Option<RatchetState> {
        SessionStore::new(self.storage.clone())
            .load(&self.public(), peer)
            .await
            .expect("session load should succeed")
    }

    async fn local_opk_count(&self) -> usize {
        PrekeyStore::load(self.storage.as_ref())
            .await
            .expect("prekey store load should succeed")
            .expect("prekey store should exist")
            .opk_count()
    }
}

async fn setup() -> (Arc<MemoryKeyServer>, Peer, Peer) {
    let server = Arc::new(MemoryKeyServer::new());
    let alice = Peer::new(&server, "alice");
    let bob = Peer::new(&server, "bob");
    bob.publish_keys(&server, "bob").await;
    (server, alice, bob)
}

#[tokio::test]
async fn test_single_message_consumes_opk() {
    let (server, alice, bob) = setup().await;
    assert_eq!(server.opk_count("bob").await, OPK_BATCH_SIZE as usize);

    let envelope = alice
        .cipher
        .encrypt_dm(
            "dm-chan",
            b"Hello Bob, this is Alice!",
            &alice.identity,
            &bob.public(),
            Some("bob"),
        )
        .await
        .unwrap();
    assert_eq!(envelope.version, VERSION_V2);
    let header = MessageHeader::parse(envelope.header.as_deref().unwrap()).unwrap();
    assert!(header.has_bootstrap());
    assert!(header.opk_id.is_some());

    let plaintext = bob
        .cipher
        .decrypt_dm("dm-chan", &envelope, &bob.identity, &alice.public())
        .await
        .unwrap();
    assert_eq!(plaintext, b"Hello Bob, this is Alice!");

    // The initiation consumed one of Bob's one-time prekeys, both on the
    // server (served in the bundle) and locally (private half destroyed).
    assert_eq!(server.opk_count("bob").await, OPK_BATCH_SIZE as usize - 1);
    assert_eq!(bob.local_opk_count().await, OPK_BATCH_SIZE as usize - 1);
}

#[tokio::test]
async fn test_round_trip_reverses_direction() {
    let (_server, alice, bob) = setup().await;

    let msg1 = alice
        .cipher
        .encrypt_dm("dm", b"msg1", &alice.identity, &bob.public(), Some("bob"))
        .await
        .unwrap();
    let received = bob
        .cipher
        .decrypt_dm("dm", &msg1, &bob.identity, &alice.public())
        .await
        .unwrap();
    assert_eq!(received, b"msg1");

    let bob_dhr_initial = bob
        .session_with(&alice.public())
        .await
        .unwrap()
        .remote_ratchet_key();

    let reply = bob
        .cipher
        .encrypt_dm("dm", b"reply", &bob.identity, &alice.public(), Some("alice"))
        .await
        .unwrap();
    let received = alice
        .cipher
        .decrypt_dm("dm", &reply, &alice.identity, &bob.public())
        .await
        .unwrap();
    assert_eq!(received, b"reply");

    let msg2 = alice
        .cipher
        .encrypt_dm("dm", b"msg2", &alice.identity, &bob.public(), Some("bob"))
        .await
        .unwrap();
    let received = bob
        .cipher
        .decrypt_dm("dm", &msg2, &bob.identity, &alice.public())
        .await
        .unwrap();
    assert_eq!(received, b"msg2");

    // Alice's reply to Bob's reversal advanced her ratchet key, so Bob now
    // tracks a different remote key than at initialization.
    let bob_dhr_after = bob
        .session_with(&alice.public())
        .await
        .unwrap()
        .remote_ratchet_key();
    assert_ne!(bob_dhr_initial, bob_dhr_after);
}

#[tokio::test]
async fn test_out_of_order_delivery() {
    let (_server, alice, bob) = setup().await;

    let mut envelopes = Vec::new();
    for text in ["first", "second", "third"] {
        envelopes.push(
            alice
                .cipher
                .encrypt_dm("dm", text.as_bytes(), &alice.identity, &bob.public(), Some("bob"))
                .await
                .unwrap(),
        );
    }

    let third = bob
        .cipher
        .decrypt_dm("dm", &envelopes[2], &bob.identity, &alice.public())
        .await
        .unwrap();
    assert_eq!(third, b"third");

    let first = bob
        .cipher
        .decrypt_dm("dm", &envelopes[0], &bob.identity, &alice.public())
        .await
        .unwrap();
    assert_eq!(first, b"first");

    let second = bob
        .cipher
        .decrypt_dm("dm", &envelopes[1], &bob.identity, &alice.public())
        .await
        .unwrap();
    assert_eq!(second, b"second");

    // Every cached key was used up.
    let state = bob.session_with(&alice.public()).await.unwrap();
    assert_eq!(state.skipped_key_count(), 0);
}

#[tokio::test]
async fn test_initiation_without_one_time_prekey() {
    let (server, alice, bob) = setup().await;

    // Exhaust Bob's server-side pool so the bundle comes without an OPK.
    let drainer = server.client("drainer");
    while server.opk_count("bob").await > 0 {
        drainer.fetch_prekey_bundle("bob").await.unwrap();
    }

    let envelope = alice
        .cipher
        .encrypt_dm("dm", b"no opk today", &alice.identity, &bob.public(), Some("bob"))
        .await
        .unwrap();
    let header = MessageHeader::parse(envelope.header.as_deref().unwrap()).unwrap();
    assert!(header.has_bootstrap());
    assert!(header.opk_id.is_none());

    let plaintext = bob
        .cipher
        .decrypt_dm("dm", &envelope, &bob.identity, &alice.public())
        .await
        .unwrap();
    assert_eq!(plaintext, b"no opk today");

    // Conversation proceeds normally afterwards.
    let reply = bob
        .cipher
        .encrypt_dm("dm", b"ack", &bob.identity, &alice.public(), Some("alice"))
        .await
        .unwrap();
    let received = alice
        .cipher
        .decrypt_dm("dm", &reply, &alice.identity, &bob.public())
        .await
        .unwrap();
    assert_eq!(received, b"ack");
}

fn flip_ciphertext_byte(envelope: &Envelope) -> Envelope {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let mut bytes = STANDARD.decode(&envelope.ciphertext).unwrap();
    bytes[0] ^= 1;
    Envelope {
        ciphertext: STANDARD.encode(&bytes),
        ..envelope.clone()
    }
}

#[tokio::test]
async fn test_tampered_ciphertext_rejected() {
    let (_server, alice, bob) = setup().await;

    let envelope = alice
        .cipher
        .encrypt_dm("dm", b"Hello Bob, this is Alice!", &alice.identity, &bob.public(), Some("bob"))
        .await
        .unwrap();

    let tampered = flip_ciphertext_byte(&envelope);
    let result = bob
        .cipher
        .decrypt_dm("dm", &tampered, &bob.identity, &alice.public())
        .await;
    assert_eq!(result.unwrap_err(), Error::DecryptFailed);
}

#[tokio::test]
async fn test_tampered_header_counter_rejected() {
    let (_server, alice, bob) = setup().await;

    let envelope = alice
        .cipher
        .encrypt_dm("dm", b"Hello Bob, this is Alice!", &alice.identity, &bob.public(), Some("bob"))
        .await
        .unwrap();

    let mut header = MessageHeader::parse(envelope.header.as_deref().unwrap()).unwrap();
    assert_eq!(header.n, 0);
    header.n = 1;
    let tampered = Envelope {
        header: Some(header.to_canonical_json()),
        ..envelope
    };

    let result = bob
        .cipher
        .decrypt_dm("dm", &tampered, &bob.identity, &alice.public())
        .await;
    assert_eq!(result.unwrap_err(), Error::DecryptFailed);
}

#[tokio::test]
async fn test_mid_conversation_persistence() {
    let (_server, alice, bob) = setup().await;

    for text in ["one", "two"] {
        let envelope = alice
            .cipher
            .encrypt_dm("dm", text.as_bytes(), &alice.identity, &bob.public(), Some("bob"))
            .await
            .unwrap();
        bob.cipher
            .decrypt_dm("dm", &envelope, &bob.identity, &alice.public())
            .await
            .unwrap();
    }

    // Freeze both sides to JSON and thaw into fresh states.
    let alice_state = alice.session_with(&bob.public()).await.unwrap();
    let bob_state = bob.session_with(&alice.public()).await.unwrap();

    let alice_json = serde_json::to_string(&SessionRecord::from_state(&alice_state)).unwrap();
    let bob_json = serde_json::to_string(&SessionRecord::from_state(&bob_state)).unwrap();

    let alice_thawed: SessionRecord = serde_json::from_str(&alice_json).unwrap();
    let bob_thawed: SessionRecord = serde_json::from_str(&bob_json).unwrap();
    let alice_state = alice_thawed.to_state().unwrap();
    let bob_state = bob_thawed.to_state().unwrap();

    // Two more messages across the revived states.
    let (sealed, alice_state) = alice_state.encrypt(&mut OsRng, b"three", None).unwrap();
    let header = MessageHeader::parse(&sealed.header).unwrap();
    let (plaintext, bob_state) = bob_state
        .decrypt(&mut OsRng, &header, sealed.header.as_bytes(), &sealed.nonce, &sealed.ciphertext)
        .unwrap();
    assert_eq!(plaintext, b"three");

    let (sealed, _bob_state) = bob_state.encrypt(&mut OsRng, b"four", None).unwrap();
    let header = MessageHeader::parse(&sealed.header).unwrap();
    let (plaintext, _alice_state) = alice_state
        .decrypt(&mut OsRng, &header, sealed.header.as_bytes(), &sealed.nonce, &sealed.ciphertext)
        .unwrap();
    assert_eq!(plaintext, b"four");
}

#[tokio::test]
async fn test_bootstrap_retry_after_session_reset() {
    let (_server, alice, bob) = setup().await;

    // Establish a session both ways.
    let envelope = alice
        .cipher
        .encrypt_dm("dm", b"hello", &alice.identity, &bob.public(), Some("bob"))
        .await
        .unwrap();
    bob.cipher
        .decrypt_dm("dm", &envelope, &bob.identity, &alice.public())
        .await
        .unwrap();

    // Alice loses her session and re-initiates from a fresh bundle. Bob's
    // stale session cannot decrypt the new initial message, so the router
    // deletes it and re-bootstraps from the header.
    alice
        .cipher
        .reset_session(&alice.public(), &bob.public())
        .await
        .unwrap();
    let envelope = alice
        .cipher
        .encrypt_dm("dm", b"hello again", &alice.identity, &bob.public(), Some("bob"))
        .await
        .unwrap();

    let plaintext = bob
        .cipher
        .decrypt_dm("dm", &envelope, &bob.identity, &alice.public())
        .await
        .unwrap();
    assert_eq!(plaintext, b"hello again");

    // And the rebuilt session keeps working.
    let reply = bob
        .cipher
        .encrypt_dm("dm", b"welcome back", &bob.identity, &alice.public(), Some("alice"))
        .await
        .unwrap();
    let received = alice
        .cipher
        .decrypt_dm("dm", &reply, &alice.identity, &bob.public())
        .await
        .unwrap();
    assert_eq!(received, b"welcome back");
}

#[tokio::test]
async fn test_v1_fallback_round_trip() {
    let server = Arc::new(MemoryKeyServer::new());
    let alice = Peer::new(&server, "alice");
    let bob = Peer::new(&server, "bob");
    // Bob never published keys; Alice falls back to the legacy path.

    let envelope = alice
        .cipher
        .encrypt_dm("dm-chan", b"legacy hello", &alice.identity, &bob.public(), Some("bob"))
        .await
        .unwrap();
    assert_eq!(envelope.version, 1);
    assert!(envelope.header.is_none());

    let plaintext = bob
        .cipher
        .decrypt_dm("dm-chan", &envelope, &bob.identity, &alice.public())
        .await
        .unwrap();
    assert_eq!(plaintext, b"legacy hello");
}

#[tokio::test]
async fn test_has_session_reflects_establishment() {
    let (_server, alice, bob) = setup().await;
    assert!(!alice
        .cipher
        .has_session(&alice.public(), &bob.public())
        .await
        .unwrap());

    let envelope = alice
        .cipher
        .encrypt_dm("dm", b"hi", &alice.identity, &bob.public(), Some("bob"))
        .await
        .unwrap();
    assert!(alice
        .cipher
        .has_session(&alice.public(), &bob.public())
        .await
        .unwrap());

    bob.cipher
        .decrypt_dm("dm", &envelope, &bob.identity, &alice.public())
        .await
        .unwrap();
    assert!(bob
        .cipher
        .has_session(&bob.public(), &alice.public())
        .await
        .unwrap());
}
