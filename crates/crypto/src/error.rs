//! Error types for the kemchat-crypto crate.

use thiserror::Error;

/// Errors that can occur during key management and message encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Password derivation failed (bad salt, rejected cost parameters).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Key encapsulation against a public key failed.
    #[error("encapsulation failed: {0}")]
    Encapsulation(String),

    /// The artifact could not be opened with the supplied private key.
    #[error("decapsulation failed: {0}")]
    Decapsulation(String),

    /// Wrapping raw key bytes failed.
    #[error("key wrap failed: {0}")]
    Wrap(String),

    /// A wrapped key failed its integrity or padding check.
    #[error("key unwrap failed: {0}")]
    Unwrap(String),

    /// A message could not be decrypted, or its conversation key could not
    /// be resolved.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The provided key material is invalid (wrong length, malformed, etc.).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A binary payload had the wrong kind, version, or length.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A conversation request was driven through a transition its state forbids.
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    /// The authentication key did not match the stored verifier.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The session was cleared (logout) and holds no key material.
    #[error("session cleared")]
    SessionCleared,

    /// A record the operation depends on does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique record (such as a username) already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database storage error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Configuration could not be loaded or is out of range.
    #[error("config error: {0}")]
    Config(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl CryptoError {
    /// Only storage/I-O failures are worth retrying; a cryptographic step fed
    /// the same inputs fails the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CryptoError::StorageError(_))
    }
}

impl From<rusqlite::Error> for CryptoError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => CryptoError::NotFound("no matching row".into()),
            other => CryptoError::StorageError(other.to_string()),
        }
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(err: base64::DecodeError) -> Self {
        CryptoError::InvalidPayload(format!("base64: {err}"))
    }
}

impl From<tokio::task::JoinError> for CryptoError {
    fn from(err: tokio::task::JoinError) -> Self {
        CryptoError::TaskJoin(err.to_string())
    }
}

impl From<CryptoError> for kemchat_shared::error::KemChatError {
    fn from(err: CryptoError) -> Self {
        use kemchat_shared::error::KemChatError;
        match err {
            CryptoError::NotFound(_) => KemChatError::NotFound,
            CryptoError::AuthenticationFailed => KemChatError::Unauthorized,
            CryptoError::Conflict(detail) => KemChatError::Conflict(detail),
            CryptoError::StorageError(detail) => KemChatError::Internal(detail),
            other => KemChatError::Crypto(other.to_string()),
        }
    }
}
