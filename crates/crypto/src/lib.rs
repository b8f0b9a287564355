//! kemchat-crypto: end-to-end key management for KemChat.
//!
//! Password-derived master keys (Argon2id), ML-KEM-768 identity keys stored
//! wrapped at rest, per-conversation key agreement by encapsulation against
//! the recipient's public key, and AES-CBC message encryption authenticated
//! with HMAC-SHA256. The server only ever holds public keys, wrapped keys,
//! artifacts and ciphertext.

pub mod error;
pub mod config;
pub mod master_key;
pub mod verifier;
pub mod payload;
pub mod key_wrap;
pub mod identity;
pub mod agreement;
pub mod message;
pub mod session;
pub mod retry;
pub mod store;
pub mod storage;
pub mod client;

pub use client::KeyService;
pub use config::CryptoConfig;
pub use error::CryptoError;
pub use session::Session;
