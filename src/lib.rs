//! # Paracord end-to-end encryption core
//!
//! Client-side Signal Protocol implementation for Paracord direct messages:
//! X3DH key agreement, Double Ratchet messaging, a persistent session and
//! prekey store, and the versioned envelope the message layer ships.
//!
//! ## Security Properties
//!
//! - **Forward secrecy**: past messages stay secret if current keys leak
//! - **Post-compromise security**: a ratchet step restores secrecy after
//!   a compromise
//! - **Asynchronous start**: the initiator encrypts against a published
//!   prekey bundle without the peer being online
//!
//! ## Architecture
//!
//! The pure protocol layers ([`x3dh`], [`ratchet`], [`crypto`], [`keys`])
//! are synchronous and deal only in values. Persistence and networking are
//! capabilities the host injects: [`storage::SecureStorage`] for the
//! session/prekey records and [`api::KeysApi`] for the server's keys
//! endpoints. [`router::DmCipher`] ties them together and is what the
//! message layer calls; [`lifecycle::maintain_prekeys`] runs on the
//! gateway's ready signal.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use paracord_e2ee::api::MemoryKeyServer;
//! use paracord_e2ee::keys::IdentitySecret;
//! use paracord_e2ee::router::DmCipher;
//! use paracord_e2ee::storage::MemoryStorage;
//! use rand_core::OsRng;
//!
//! # async fn example() -> paracord_e2ee::Result<()> {
//! let server = Arc::new(MemoryKeyServer::new());
//! let cipher = DmCipher::new(
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(server.client("alice")),
//! );
//!
//! let alice = IdentitySecret::generate(&mut OsRng);
//! let bob_public = IdentitySecret::generate(&mut OsRng).public();
//!
//! let _envelope = cipher
//!     .encrypt_dm("channel-1", b"hi bob", &alice, &bob_public, Some("bob"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]

pub mod api;
pub mod codec;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod prekeys;
pub mod ratchet;
pub mod router;
pub mod session;
pub mod storage;
pub mod x3dh;

// Re-export main types
pub use envelope::{Envelope, MessageHeader};
pub use error::{Error, Result};
pub use keys::{IdentityPublic, IdentitySecret, PublicKey, SecretKey};
pub use ratchet::RatchetState;
pub use router::DmCipher;
pub use x3dh::{InitiateOutcome, PrekeyBundle};
