//! Password-based master key derivation.
//!
//! A password and a per-user salt go through Argon2id to produce 32 bytes of
//! master key material. The first half is the local decryption key used to
//! wrap the identity private key and every conversation key; the second half
//! is the authentication key, the only part that ever leaves the client.

use base64::Engine;
use kemchat_shared::api::auth::LoginRequest;
use kemchat_shared::constants::SALT_LENGTH;
use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

const MASTER_KEY_LEN: usize = 32;
pub const DECRYPTION_KEY_LEN: usize = 16;
pub const AUTHENTICATION_KEY_LEN: usize = 16;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB. Default: 65536 (64 MiB)
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    /// Number of passes. Default: 3
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Lanes. Default: 4
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

fn default_memory_kib() -> u32 {
    65536
}
fn default_iterations() -> u32 {
    3
}
fn default_parallelism() -> u32 {
    4
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

impl KdfParams {
    /// Fail early on parameters argon2 would refuse at derivation time.
    pub fn validate(&self) -> Result<(), CryptoError> {
        self.argon2_params().map(|_| ())
    }

    pub(crate) fn argon2_params(&self) -> Result<argon2::Params, CryptoError> {
        argon2::Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(MASTER_KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
    }
}

/// Per-user random salt, generated at registration and stored next to the
/// public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_LENGTH]);

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Salt({})", self.to_base64())
    }
}

impl Salt {
    /// Generate a random 16-byte salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut salt);
        Self(salt)
    }

    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(s)?;
        let arr: [u8; SALT_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyDerivation("salt must be 16 bytes".into()))?;
        Ok(Self(arr))
    }
}

/// The local unwrap key: `master[0..16]`. Never leaves the client.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DecryptionKey {
    key: [u8; DECRYPTION_KEY_LEN],
}

impl std::fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl DecryptionKey {
    pub fn from_bytes(key: [u8; DECRYPTION_KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; DECRYPTION_KEY_LEN] {
        &self.key
    }
}

/// Proof of password knowledge sent to the server instead of the password:
/// `master[16..32]`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthenticationKey {
    key: [u8; AUTHENTICATION_KEY_LEN],
}

impl std::fmt::Debug for AuthenticationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl AuthenticationKey {
    pub fn as_bytes(&self) -> &[u8; AUTHENTICATION_KEY_LEN] {
        &self.key
    }

    /// Base64 form carried in signup and login requests.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.key)
    }
}

/// Both halves of the derived master key. Each half wipes itself on drop.
#[derive(Debug, Clone)]
pub struct MasterKeyMaterial {
    pub decryption_key: DecryptionKey,
    pub authentication_key: AuthenticationKey,
}

impl MasterKeyMaterial {
    /// Build the login request for `username` from the authentication half.
    pub fn login_request(&self, username: &str) -> LoginRequest {
        LoginRequest {
            username: username.to_string(),
            authentication_key: self.authentication_key.to_base64(),
        }
    }
}

/// Derive master key material from a password and salt via Argon2id.
///
/// Deterministic for identical inputs. Any failure aborts; no partial key is
/// ever returned.
pub fn derive_master_key(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<MasterKeyMaterial, CryptoError> {
    if salt.len() < SALT_LENGTH {
        return Err(CryptoError::KeyDerivation("salt too short".into()));
    }

    let argon2 = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        params.argon2_params()?,
    );

    let mut output = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, output.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut decryption = [0u8; DECRYPTION_KEY_LEN];
    let mut authentication = [0u8; AUTHENTICATION_KEY_LEN];
    decryption.copy_from_slice(&output[..DECRYPTION_KEY_LEN]);
    authentication.copy_from_slice(&output[DECRYPTION_KEY_LEN..]);

    Ok(MasterKeyMaterial {
        decryption_key: DecryptionKey { key: decryption },
        authentication_key: AuthenticationKey {
            key: authentication,
        },
    })
}

/// Run [`derive_master_key`] on the blocking pool so the caller's executor
/// thread stays responsive.
pub async fn derive_master_key_async(
    password: Zeroizing<String>,
    salt: Salt,
    params: KdfParams,
) -> Result<MasterKeyMaterial, CryptoError> {
    tokio::task::spawn_blocking(move || derive_master_key(&password, salt.as_bytes(), &params))
        .await?
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derive(password: &str, salt: &[u8]) -> MasterKeyMaterial {
        derive_master_key(password, salt, &test_params()).unwrap()
    }

    #[test]
    fn same_password_same_salt_produces_same_key() {
        let salt = [1u8; 16];
        let a = derive("same-pass", &salt);
        let b = derive("same-pass", &salt);
        assert_eq!(a.decryption_key.as_bytes(), b.decryption_key.as_bytes());
        assert_eq!(
            a.authentication_key.as_bytes(),
            b.authentication_key.as_bytes()
        );
    }

    #[test]
    fn different_password_same_salt_produces_different_key() {
        let salt = [2u8; 16];
        let a = derive("password1", &salt);
        let b = derive("password2", &salt);
        assert_ne!(a.decryption_key.as_bytes(), b.decryption_key.as_bytes());
    }

    #[test]
    fn same_password_different_salt_produces_different_key() {
        let a = derive("same-pass", &[3u8; 16]);
        let b = derive("same-pass", &[4u8; 16]);
        assert_ne!(a.decryption_key.as_bytes(), b.decryption_key.as_bytes());
        assert_ne!(
            a.authentication_key.as_bytes(),
            b.authentication_key.as_bytes()
        );
    }

    #[test]
    fn halves_are_the_two_sides_of_one_argon2_output() {
        let salt = [5u8; 16];
        let material = derive("split", &salt);

        let argon2 = argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            test_params().argon2_params().unwrap(),
        );
        let mut full = [0u8; 32];
        argon2.hash_password_into(b"split", &salt, &mut full).unwrap();

        assert_eq!(material.decryption_key.as_bytes(), &full[..16]);
        assert_eq!(material.authentication_key.as_bytes(), &full[16..]);
        assert_ne!(
            material.decryption_key.as_bytes(),
            material.authentication_key.as_bytes()
        );
    }

    #[test]
    fn salt_too_short_returns_error() {
        let result = derive_master_key("pass", &[0u8; 8], &test_params());
        assert!(matches!(result, Err(CryptoError::KeyDerivation(_))));
    }

    #[test]
    fn rejected_cost_parameters_fail_derivation() {
        let params = KdfParams {
            memory_kib: 1,
            iterations: 1,
            parallelism: 1,
        };
        let result = derive_master_key("pass", &[0u8; 16], &params);
        assert!(matches!(result, Err(CryptoError::KeyDerivation(_))));
    }

    #[test]
    fn default_params_validate() {
        KdfParams::default().validate().unwrap();
    }

    #[test]
    fn generate_salt_is_random() {
        assert_ne!(Salt::generate(), Salt::generate());
    }

    #[test]
    fn salt_base64_round_trips() {
        let salt = Salt::generate();
        assert_eq!(Salt::from_base64(&salt.to_base64()).unwrap(), salt);
    }

    #[test]
    fn salt_from_base64_rejects_wrong_length() {
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 8]);
        assert!(Salt::from_base64(&short).is_err());
    }

    #[test]
    fn key_debug_is_redacted() {
        let material = derive("debug-test", &[14u8; 16]);
        let debug = format!("{material:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&format!("{:?}", material.decryption_key.as_bytes())));
    }

    #[test]
    fn login_request_carries_authentication_half_only() {
        let material = derive("login", &[6u8; 16]);
        let req = material.login_request("alice");
        assert_eq!(req.username, "alice");
        assert_eq!(req.authentication_key, material.authentication_key.to_base64());
        let decryption_b64 =
            base64::engine::general_purpose::STANDARD.encode(material.decryption_key.as_bytes());
        assert_ne!(req.authentication_key, decryption_b64);
    }

    #[tokio::test]
    async fn async_derivation_matches_blocking() {
        let salt = Salt::from_bytes([9u8; 16]);
        let blocking = derive("async", salt.as_bytes());
        let off_thread =
            derive_master_key_async(Zeroizing::new("async".to_string()), salt, test_params())
                .await
                .unwrap();
        assert_eq!(
            blocking.decryption_key.as_bytes(),
            off_thread.decryption_key.as_bytes()
        );
    }
}
