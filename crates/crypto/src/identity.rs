//! Long-term identity keys for kemchat-crypto.
//!
//! Each user holds one ML-KEM-768 keypair. The public key is published; the
//! private key is only ever stored wrapped under the user's password-derived
//! decryption key, and is unwrapped in memory after login.

use base64::Engine;
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem768};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use kemchat_shared::api::auth::SignupRequest;

use crate::error::CryptoError;
use crate::key_wrap;
use crate::master_key::{self, DecryptionKey, KdfParams, MasterKeyMaterial, Salt};
use crate::payload::{KeyWrapPayload, Payload, FINGERPRINT_LEN, KEM_CIPHERTEXT_LEN};

pub const PUBLIC_KEY_LEN: usize = 1184;
pub const PRIVATE_KEY_LEN: usize = 2400;
pub const SHARED_SECRET_LEN: usize = 32;

// FIPS 203 decapsulation key layout: dk_pke[1152] | ek[1184] | H(ek)[32] | z[32].
const EMBEDDED_PUBLIC_KEY_OFFSET: usize = 1152;

type EncapsulationKey = <MlKem768 as KemCore>::EncapsulationKey;
type DecapsulationKey = <MlKem768 as KemCore>::DecapsulationKey;

/// A user's published ML-KEM-768 encapsulation key.
#[derive(Clone, PartialEq, Eq)]
pub struct KemPublicKey(Vec<u8>);

impl std::fmt::Debug for KemPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fingerprint = self.fingerprint();
        write!(
            f,
            "KemPublicKey({:02x}{:02x}{:02x}{:02x}..)",
            fingerprint[0], fingerprint[1], fingerprint[2], fingerprint[3]
        )
    }
}

impl KemPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(s)?;
        Self::from_bytes(&bytes)
    }

    /// SHA-256 of the encoded key.
    pub fn fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
        Sha256::digest(&self.0).into()
    }

    /// Fingerprint as lowercase hex in groups of four, for comparing keys
    /// out of band.
    pub fn fingerprint_display(&self) -> String {
        self.fingerprint()
            .chunks(2)
            .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Encapsulate a fresh shared secret against this key. Returns the KEM
    /// ciphertext and the secret.
    pub(crate) fn encapsulate(
        &self,
    ) -> Result<(Vec<u8>, Zeroizing<[u8; SHARED_SECRET_LEN]>), CryptoError> {
        let encoded: &Encoded<EncapsulationKey> = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Encapsulation("malformed public key".into()))?;
        let ek = EncapsulationKey::from_bytes(encoded);

        let (ciphertext, shared) = ek
            .encapsulate(&mut rand_core::OsRng)
            .map_err(|_| CryptoError::Encapsulation("ML-KEM encapsulation failed".into()))?;

        let mut secret = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
        secret.copy_from_slice(shared.as_slice());
        Ok((ciphertext.to_vec(), secret))
    }
}

/// The unlocked ML-KEM-768 decapsulation key. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KemPrivateKey {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for KemPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KemPrivateKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl KemPrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PRIVATE_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "private key must be {PRIVATE_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The encapsulation key embedded in the decapsulation key.
    pub fn public_key(&self) -> KemPublicKey {
        KemPublicKey(
            self.bytes[EMBEDDED_PUBLIC_KEY_OFFSET..EMBEDDED_PUBLIC_KEY_OFFSET + PUBLIC_KEY_LEN]
                .to_vec(),
        )
    }

    /// Recover the shared secret from a KEM ciphertext.
    ///
    /// ML-KEM rejects implicitly: a ciphertext made for another key yields a
    /// pseudorandom secret, not an error. Callers confirm the result.
    pub(crate) fn decapsulate(
        &self,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<[u8; SHARED_SECRET_LEN]>, CryptoError> {
        let ciphertext: &ml_kem::Ciphertext<MlKem768> = ciphertext.try_into().map_err(|_| {
            CryptoError::Decapsulation(format!("artifact must be {KEM_CIPHERTEXT_LEN} bytes"))
        })?;
        let encoded: &Encoded<DecapsulationKey> = self
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Decapsulation("malformed private key".into()))?;
        let dk = DecapsulationKey::from_bytes(encoded);

        let shared = dk
            .decapsulate(ciphertext)
            .map_err(|_| CryptoError::Decapsulation("ML-KEM decapsulation failed".into()))?;

        let mut secret = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
        secret.copy_from_slice(shared.as_slice());
        Ok(secret)
    }
}

#[derive(Debug, Clone)]
pub struct KemKeyPair {
    pub public_key: KemPublicKey,
    pub private_key: KemPrivateKey,
}

/// Generate a fresh ML-KEM-768 keypair from the OS RNG.
pub fn generate_keypair() -> KemKeyPair {
    let (dk, ek) = MlKem768::generate(&mut rand_core::OsRng);
    KemKeyPair {
        public_key: KemPublicKey(ek.as_bytes().to_vec()),
        private_key: KemPrivateKey {
            bytes: dk.as_bytes().to_vec(),
        },
    }
}

/// Wrap a private key under the owner's decryption key for storage.
pub fn seal_private_key(
    private_key: &KemPrivateKey,
    decryption_key: &DecryptionKey,
) -> Result<KeyWrapPayload, CryptoError> {
    key_wrap::wrap_key(private_key.as_bytes(), decryption_key)
}

/// Unwrap a stored private key. A wrong password surfaces as
/// `CryptoError::Unwrap`.
pub fn unlock_private_key(
    encrypted: &KeyWrapPayload,
    decryption_key: &DecryptionKey,
) -> Result<KemPrivateKey, CryptoError> {
    let raw = key_wrap::decrypt_key(encrypted, decryption_key)?;
    KemPrivateKey::from_bytes(&raw)
}

/// Everything produced at registration. Only the public key, the encrypted
/// private key, the salt and the authentication key leave the client.
#[derive(Debug, Clone)]
pub struct RegisteredIdentity {
    pub public_key: KemPublicKey,
    pub encrypted_private_key: KeyWrapPayload,
    pub salt: Salt,
    pub master: MasterKeyMaterial,
}

impl RegisteredIdentity {
    pub fn signup_request(&self, username: &str, display_name: &str) -> SignupRequest {
        SignupRequest {
            username: username.to_string(),
            display_name: display_name.to_string(),
            authentication_key: self.master.authentication_key.to_base64(),
            public_key: self.public_key.to_base64(),
            encrypted_private_key: self.encrypted_private_key.to_base64(),
            salt: self.salt.to_base64(),
        }
    }
}

/// Create a new identity: fresh salt, master key derivation, keypair
/// generation, and private key wrapping.
pub fn register_identity(
    password: &str,
    params: &KdfParams,
) -> Result<RegisteredIdentity, CryptoError> {
    let salt = Salt::generate();
    let master = master_key::derive_master_key(password, salt.as_bytes(), params)?;

    let keypair = generate_keypair();
    let encrypted_private_key = seal_private_key(&keypair.private_key, &master.decryption_key)?;

    tracing::debug!(
        fingerprint = %keypair.public_key.fingerprint_display(),
        "identity keypair generated"
    );

    Ok(RegisteredIdentity {
        public_key: keypair.public_key,
        encrypted_private_key,
        salt,
        master,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_key::test_params;

    #[test]
    fn generated_keys_have_ml_kem_768_sizes() {
        let pair = generate_keypair();
        assert_eq!(pair.public_key.as_bytes().len(), PUBLIC_KEY_LEN);
        assert_eq!(pair.private_key.as_bytes().len(), PRIVATE_KEY_LEN);
    }

    #[test]
    fn private_key_embeds_its_public_key() {
        let pair = generate_keypair();
        assert_eq!(pair.private_key.public_key(), pair.public_key);
    }

    #[test]
    fn decapsulate_recovers_encapsulated_secret() {
        let pair = generate_keypair();
        let (ciphertext, secret) = pair.public_key.encapsulate().unwrap();
        assert_eq!(ciphertext.len(), KEM_CIPHERTEXT_LEN);
        let recovered = pair.private_key.decapsulate(&ciphertext).unwrap();
        assert_eq!(*recovered, *secret);
    }

    #[test]
    fn other_private_key_yields_different_secret() {
        let alice = generate_keypair();
        let mallory = generate_keypair();
        let (ciphertext, secret) = alice.public_key.encapsulate().unwrap();
        let wrong = mallory.private_key.decapsulate(&ciphertext).unwrap();
        assert_ne!(*wrong, *secret);
    }

    #[test]
    fn truncated_artifact_fails_decapsulation() {
        let pair = generate_keypair();
        let result = pair.private_key.decapsulate(&[0u8; 100]);
        assert!(matches!(result, Err(CryptoError::Decapsulation(_))));
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        assert!(matches!(
            KemPublicKey::from_bytes(&[0u8; 32]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn public_key_base64_round_trip() {
        let pair = generate_keypair();
        let text = pair.public_key.to_base64();
        assert_eq!(KemPublicKey::from_base64(&text).unwrap(), pair.public_key);
    }

    #[test]
    fn fingerprint_display_is_sixteen_hex_groups() {
        let pair = generate_keypair();
        let display = pair.public_key.fingerprint_display();
        let groups: Vec<&str> = display.split(' ').collect();
        assert_eq!(groups.len(), 16);
        assert!(groups
            .iter()
            .all(|g| g.len() == 4 && g.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn private_key_debug_is_redacted() {
        let pair = generate_keypair();
        let debug = format!("{:?}", pair.private_key);
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.len() < 64);
    }

    #[test]
    fn register_identity_private_key_unlocks_with_password_key() {
        let identity = register_identity("correct horse", &test_params()).unwrap();
        let unlocked =
            unlock_private_key(&identity.encrypted_private_key, &identity.master.decryption_key)
                .unwrap();
        assert_eq!(unlocked.public_key(), identity.public_key);
    }

    #[test]
    fn wrong_password_cannot_unlock_private_key() {
        let identity = register_identity("right", &test_params()).unwrap();
        let wrong =
            master_key::derive_master_key("wrong", identity.salt.as_bytes(), &test_params())
                .unwrap();
        let result = unlock_private_key(&identity.encrypted_private_key, &wrong.decryption_key);
        assert!(matches!(result, Err(CryptoError::Unwrap(_))));
    }

    #[test]
    fn each_registration_draws_its_own_salt() {
        let a = register_identity("same", &test_params()).unwrap();
        let b = register_identity("same", &test_params()).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(
            a.master.decryption_key.as_bytes(),
            b.master.decryption_key.as_bytes()
        );
    }

    #[test]
    fn signup_request_carries_only_public_material() {
        let identity = register_identity("signup", &test_params()).unwrap();
        let request = identity.signup_request("alice", "Alice");
        request.validate().unwrap();
        assert_eq!(request.public_key, identity.public_key.to_base64());
        assert_eq!(request.salt, identity.salt.to_base64());
        assert_eq!(
            request.authentication_key,
            identity.master.authentication_key.to_base64()
        );
        let decryption_b64 = base64::engine::general_purpose::STANDARD
            .encode(identity.master.decryption_key.as_bytes());
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains(&decryption_b64));
    }
}
