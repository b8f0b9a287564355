//! The logged-in user's key material.
//!
//! A [`Session`] is created at login, owned by the caller and passed into
//! every operation that needs the decryption key or the unlocked private key.
//! [`Session::clear`] wipes both; afterwards every accessor fails with
//! `CryptoError::SessionCleared`.

use zeroize::Zeroize;

use kemchat_shared::ids::UserId;

use crate::error::CryptoError;
use crate::identity::{KemPrivateKey, KemPublicKey};
use crate::master_key::DecryptionKey;

struct SessionKeys {
    decryption_key: DecryptionKey,
    private_key: KemPrivateKey,
}

pub struct Session {
    user_id: UserId,
    keys: Option<SessionKeys>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Session {
    pub fn new(user_id: UserId, decryption_key: DecryptionKey, private_key: KemPrivateKey) -> Self {
        Self {
            user_id,
            keys: Some(SessionKeys {
                decryption_key,
                private_key,
            }),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn is_active(&self) -> bool {
        self.keys.is_some()
    }

    pub fn decryption_key(&self) -> Result<&DecryptionKey, CryptoError> {
        self.keys
            .as_ref()
            .map(|k| &k.decryption_key)
            .ok_or(CryptoError::SessionCleared)
    }

    pub fn private_key(&self) -> Result<&KemPrivateKey, CryptoError> {
        self.keys
            .as_ref()
            .map(|k| &k.private_key)
            .ok_or(CryptoError::SessionCleared)
    }

    pub fn public_key(&self) -> Result<KemPublicKey, CryptoError> {
        self.private_key().map(KemPrivateKey::public_key)
    }

    /// Zero the decryption key and private key. Idempotent.
    pub fn clear(&mut self) {
        if let Some(mut keys) = self.keys.take() {
            keys.decryption_key.zeroize();
            keys.private_key.zeroize();
            tracing::debug!(user_id = %self.user_id, "session cleared");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_keypair;

    fn session() -> Session {
        let pair = generate_keypair();
        Session::new(
            UserId::new(),
            DecryptionKey::from_bytes([1u8; 16]),
            pair.private_key,
        )
    }

    #[test]
    fn active_session_exposes_keys() {
        let session = session();
        assert!(session.is_active());
        assert_eq!(session.decryption_key().unwrap().as_bytes(), &[1u8; 16]);
        assert!(session.private_key().is_ok());
        assert!(session.public_key().is_ok());
    }

    #[test]
    fn cleared_session_refuses_key_access() {
        let mut session = session();
        session.clear();
        assert!(!session.is_active());
        assert!(matches!(
            session.decryption_key(),
            Err(CryptoError::SessionCleared)
        ));
        assert!(matches!(session.private_key(), Err(CryptoError::SessionCleared)));
        assert!(matches!(session.public_key(), Err(CryptoError::SessionCleared)));
    }

    #[test]
    fn clear_is_idempotent() {
        let mut session = session();
        session.clear();
        session.clear();
        assert!(!session.is_active());
    }

    #[test]
    fn debug_output_omits_key_material() {
        let session = session();
        let debug = format!("{session:?}");
        assert!(debug.contains("active: true"));
        assert!(!debug.contains("KemPrivateKey"));
    }
}
