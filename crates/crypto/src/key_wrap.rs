//! Symmetric key wrapping: AES-CBC with PKCS#7 padding, authenticated by
//! HMAC-SHA256 over the payload header, IV and ciphertext.
//!
//! The AES variant follows the wrapping key: a 16-byte decryption key selects
//! AES-128, a 32-byte conversation key AES-256. The MAC key is derived from
//! the wrapping key with HKDF-SHA256 and bound to the payload kind, so a tag
//! made for a wrapped key never verifies as a message tag.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes256};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::payload::{KeyWrapPayload, PayloadKind, SealedBody, IV_LEN, MAC_LEN};

type HmacSha256 = Hmac<Sha256>;

const MAC_KEY_INFO: &[u8] = b"kemchat-payload-mac-v1";

/// Anything that can wrap raw key bytes or message text.
pub trait WrappingKey {
    fn key_bytes(&self) -> &[u8];
}

impl WrappingKey for crate::master_key::DecryptionKey {
    fn key_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Low-level failure of [`seal`]/[`open`]; callers map it to the error of
/// their own operation.
#[derive(Debug)]
pub(crate) enum SealError {
    InvalidKey(String),
    Integrity(&'static str),
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealError::InvalidKey(detail) => write!(f, "invalid key: {detail}"),
            SealError::Integrity(detail) => write!(f, "integrity check failed: {detail}"),
        }
    }
}

/// Fresh random IV. Every wrap and every message draws its own.
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut iv);
    iv
}

fn cbc_encrypt(key: &[u8], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let invalid = |e: aes::cipher::InvalidLength| SealError::InvalidKey(e.to_string());
    match key.len() {
        16 => Ok(cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        32 => Ok(cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        n => Err(SealError::InvalidKey(format!("unsupported key length {n}"))),
    }
}

fn cbc_decrypt(key: &[u8], iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, SealError> {
    let invalid = |e: aes::cipher::InvalidLength| SealError::InvalidKey(e.to_string());
    let unpadded = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        n => return Err(SealError::InvalidKey(format!("unsupported key length {n}"))),
    };
    unpadded.map_err(|_| SealError::Integrity("invalid padding"))
}

fn payload_mac(key: &[u8], kind: PayloadKind) -> Result<HmacSha256, SealError> {
    let mut info = MAC_KEY_INFO.to_vec();
    info.push(kind as u8);

    let hk = Hkdf::<Sha256>::new(None, key);
    let mut mac_key = Zeroizing::new([0u8; MAC_LEN]);
    hk.expand(&info, mac_key.as_mut())
        .map_err(|e| SealError::InvalidKey(e.to_string()))?;

    <HmacSha256 as Mac>::new_from_slice(mac_key.as_ref())
        .map_err(|e| SealError::InvalidKey(e.to_string()))
}

/// Encrypt-then-MAC `plaintext` under `key` with an explicit IV.
pub(crate) fn seal(
    kind: PayloadKind,
    key: &[u8],
    iv: [u8; IV_LEN],
    plaintext: &[u8],
) -> Result<SealedBody, SealError> {
    let ciphertext = cbc_encrypt(key, &iv, plaintext)?;
    let mut body = SealedBody {
        iv,
        ciphertext,
        mac: [0u8; MAC_LEN],
    };

    let mut mac = payload_mac(key, kind)?;
    mac.update(&body.authenticated_bytes(kind));
    body.mac = mac.finalize().into_bytes().into();
    Ok(body)
}

/// Verify the MAC, then decrypt and unpad. The MAC is checked first and in
/// constant time; no plaintext is produced for a tampered body.
pub(crate) fn open(
    kind: PayloadKind,
    key: &[u8],
    body: &SealedBody,
) -> Result<Zeroizing<Vec<u8>>, SealError> {
    let mut mac = payload_mac(key, kind)?;
    mac.update(&body.authenticated_bytes(kind));
    mac.verify_slice(&body.mac)
        .map_err(|_| SealError::Integrity("mac mismatch"))?;

    cbc_decrypt(key, &body.iv, &body.ciphertext).map(Zeroizing::new)
}

/// Wrap `raw` under `wrapping_key` with the given IV.
///
/// The caller must not reuse an IV with the same wrapping key for a different
/// secret; [`wrap_key`] draws a fresh one.
pub fn encrypt_key(
    raw: &[u8],
    wrapping_key: &impl WrappingKey,
    iv: [u8; IV_LEN],
) -> Result<KeyWrapPayload, CryptoError> {
    if raw.is_empty() {
        return Err(CryptoError::Wrap("refusing to wrap an empty key".into()));
    }
    seal(PayloadKind::KeyWrap, wrapping_key.key_bytes(), iv, raw)
        .map(KeyWrapPayload)
        .map_err(|e| CryptoError::Wrap(e.to_string()))
}

/// Wrap `raw` under `wrapping_key` with a fresh random IV.
pub fn wrap_key(raw: &[u8], wrapping_key: &impl WrappingKey) -> Result<KeyWrapPayload, CryptoError> {
    encrypt_key(raw, wrapping_key, generate_iv())
}

/// Recover the raw key bytes. Fails with `CryptoError::Unwrap` on a wrong key,
/// a modified payload, or bad padding.
pub fn decrypt_key(
    payload: &KeyWrapPayload,
    wrapping_key: &impl WrappingKey,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    open(PayloadKind::KeyWrap, wrapping_key.key_bytes(), &payload.0).map_err(|e| {
        tracing::warn!(error = %e, "wrapped key rejected");
        CryptoError::Unwrap(e.to_string())
    })
}
