//! Error types for the encryption core.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the encryption core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Signature on a peer's signed prekey failed verification
    #[error("prekey bundle rejected: bad signed prekey signature")]
    BadPrekeyBundle,

    /// Responder attempted to send before receiving the first message
    #[error("sending chain not initialized")]
    SendingChainNotInitialized,

    /// Header counter jumped beyond the skipped-key budget
    #[error("too many skipped message keys")]
    TooManySkipped,

    /// v2 payload without bootstrap material and no established session
    #[error("no session for peer")]
    NoSession,

    /// Ciphertext or header tampered, or wrong key
    #[error("decryption failed")]
    DecryptFailed,

    /// Initial X3DH message arrived before local prekeys were generated
    #[error("no local prekey store")]
    NoPrekeyStore,

    /// Envelope version outside the supported set
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    /// Malformed wire or persisted data
    #[error("malformed data: {0}")]
    Malformed(&'static str),

    /// Secure storage backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Keys API failure
    #[error("keys api error: {0}")]
    Api(String),
}
