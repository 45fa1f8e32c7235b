//! X3DH agreement symmetry under adversarial and repeated conditions.

use paracord_e2ee::error::Error;
use paracord_e2ee::keys::{IdentitySecret, SecretKey};
use paracord_e2ee::x3dh::{initiate, respond, OneTimePrekey, PrekeyBundle, SignedPrekey};
use rand_core::OsRng;

fn bundle_for(identity: &IdentitySecret, with_opk: bool) -> (PrekeyBundle, SecretKey, Option<SecretKey>) {
    let spk = SecretKey::generate(&mut OsRng);
    let signature = identity.sign(spk.public_key().as_bytes());
    let opk = with_opk.then(|| SecretKey::generate(&mut OsRng));

    let bundle = PrekeyBundle {
        identity_key: identity.public(),
        signed_prekey: SignedPrekey {
            id: 1,
            public_key: spk.public_key(),
            signature,
        },
        one_time_prekey: opk.as_ref().map(|k| OneTimePrekey {
            id: 100,
            public_key: k.public_key(),
        }),
    };
    (bundle, spk, opk)
}

#[test]
fn test_symmetry_over_many_runs() {
    for run in 0..100 {
        let alice = IdentitySecret::generate(&mut OsRng);
        let bob = IdentitySecret::generate(&mut OsRng);
        let (bundle, spk, opk) = bundle_for(&bob, run % 2 == 0);

        let outcome = initiate(&mut OsRng, &alice, &bundle).unwrap();
        let responder_secret = respond(
            &bob,
            &spk,
            opk.as_ref(),
            &alice.public(),
            &outcome.ephemeral_public,
        )
        .unwrap();

        assert_eq!(outcome.shared_secret, responder_secret, "run {run}");
    }
}

#[test]
fn test_identity_substitution_breaks_verification() {
    let alice = IdentitySecret::generate(&mut OsRng);
    let bob = IdentitySecret::generate(&mut OsRng);
    let mallory = IdentitySecret::generate(&mut OsRng);
    let (mut bundle, _, _) = bundle_for(&bob, false);

    // A MITM swapping in their own identity cannot keep Bob's prekey
    // signature valid.
    bundle.identity_key = mallory.public();
    assert_eq!(
        initiate(&mut OsRng, &alice, &bundle).unwrap_err(),
        Error::BadPrekeyBundle
    );
}

#[test]
fn test_wrong_opk_secret_diverges() {
    let alice = IdentitySecret::generate(&mut OsRng);
    let bob = IdentitySecret::generate(&mut OsRng);
    let (bundle, spk, _opk) = bundle_for(&bob, true);

    let outcome = initiate(&mut OsRng, &alice, &bundle).unwrap();

    // Responding with a different OPK private key than the bundle advertised
    // produces a different secret.
    let wrong_opk = SecretKey::generate(&mut OsRng);
    let responder_secret = respond(
        &bob,
        &spk,
        Some(&wrong_opk),
        &alice.public(),
        &outcome.ephemeral_public,
    )
    .unwrap();
    assert_ne!(outcome.shared_secret, responder_secret);
}

#[test]
fn test_omitting_opk_diverges() {
    let alice = IdentitySecret::generate(&mut OsRng);
    let bob = IdentitySecret::generate(&mut OsRng);
    let (bundle, spk, _opk) = bundle_for(&bob, true);

    let outcome = initiate(&mut OsRng, &alice, &bundle).unwrap();

    // 4-DH on one side, 3-DH on the other: no agreement.
    let responder_secret = respond(&bob, &spk, None, &alice.public(), &outcome.ephemeral_public)
        .unwrap();
    assert_ne!(outcome.shared_secret, responder_secret);
}
