//! Server-side password verifier.
//!
//! The server never sees the password or the decryption key. At signup it
//! receives the authentication half of the master key and stores only an
//! Argon2id PHC hash of it.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::Engine;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::master_key::{AuthenticationKey, KdfParams, AUTHENTICATION_KEY_LEN};

const VERIFIER_SALT_LEN: usize = 16;

fn hasher(params: &KdfParams) -> Result<Argon2<'static>, CryptoError> {
    Ok(Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        params.argon2_params()?,
    ))
}

/// Decode a base64 authentication key as sent in a signup or login request.
pub fn decode_authentication_key(s: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let bytes = Zeroizing::new(base64::engine::general_purpose::STANDARD.decode(s)?);
    if bytes.len() != AUTHENTICATION_KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "authentication key must be {AUTHENTICATION_KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Hash raw authentication key bytes into a PHC string for storage.
pub fn hash_authentication_key(key: &[u8], params: &KdfParams) -> Result<String, CryptoError> {
    let mut salt_bytes = [0u8; VERIFIER_SALT_LEN];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let hash = hasher(params)?
        .hash_password(key, &salt)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(hash.to_string())
}

/// Check raw authentication key bytes against a stored PHC string. Cost
/// parameters come from the stored hash.
pub fn verify_authentication_key(key: &[u8], verifier: &str) -> Result<(), CryptoError> {
    let parsed = PasswordHash::new(verifier)
        .map_err(|e| CryptoError::InvalidPayload(format!("malformed verifier: {e}")))?;
    Argon2::default()
        .verify_password(key, &parsed)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

impl AuthenticationKey {
    /// Verifier for this key, as the server would store it.
    pub fn to_verifier(&self, params: &KdfParams) -> Result<String, CryptoError> {
        hash_authentication_key(self.as_bytes(), params)
    }
}
