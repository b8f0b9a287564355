//! Versioned binary layouts for everything that crosses the client boundary.
//!
//! Each payload starts with a one-byte kind tag and a one-byte version, so a
//! wrapped key can never be decoded as a message or an artifact:
//!
//! ```text
//! KeyWrapPayload       01 | 01 | iv[16] | ciphertext[16n] | mac[32]
//! EncapsulationPayload 02 | 01 | recipient_fingerprint[32] | kem_ct[1088] | confirmation[32]
//! MessagePayload       03 | 01 | iv[16] | ciphertext[16n] | mac[32]
//! ```
//!
//! Text form is standard base64; serde uses the same string.

use base64::Engine;

use crate::error::CryptoError;

pub const PAYLOAD_VERSION: u8 = 1;
pub const IV_LEN: usize = 16;
pub const MAC_LEN: usize = 32;
pub const FINGERPRINT_LEN: usize = 32;
pub const CONFIRMATION_LEN: usize = 32;
/// ML-KEM-768 ciphertext size.
pub const KEM_CIPHERTEXT_LEN: usize = 1088;

const HEADER_LEN: usize = 2;
const BLOCK_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    KeyWrap = 0x01,
    Encapsulation = 0x02,
    Message = 0x03,
}

impl PayloadKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(PayloadKind::KeyWrap),
            0x02 => Some(PayloadKind::Encapsulation),
            0x03 => Some(PayloadKind::Message),
            _ => None,
        }
    }

    pub fn header(self) -> [u8; HEADER_LEN] {
        [self as u8, PAYLOAD_VERSION]
    }
}

/// Common binary/text encoding for the three payload types.
pub trait Payload: Sized {
    const KIND: PayloadKind;

    fn to_bytes(&self) -> Vec<u8>;

    /// Parse the body that follows a verified header.
    fn parse_body(body: &[u8]) -> Result<Self, CryptoError>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let body = check_header(bytes, Self::KIND)?;
        Self::parse_body(body)
    }

    fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(s)?;
        Self::from_bytes(&bytes)
    }
}

fn check_header(bytes: &[u8], expected: PayloadKind) -> Result<&[u8], CryptoError> {
    if bytes.len() < HEADER_LEN {
        return Err(CryptoError::InvalidPayload("payload too short".into()));
    }
    match PayloadKind::from_tag(bytes[0]) {
        Some(kind) if kind == expected => {}
        Some(kind) => {
            return Err(CryptoError::InvalidPayload(format!(
                "expected {expected:?} payload, got {kind:?}"
            )))
        }
        None => {
            return Err(CryptoError::InvalidPayload(format!(
                "unknown payload kind 0x{:02x}",
                bytes[0]
            )))
        }
    }
    if bytes[1] != PAYLOAD_VERSION {
        return Err(CryptoError::InvalidPayload(format!(
            "unsupported payload version {}",
            bytes[1]
        )));
    }
    Ok(&bytes[HEADER_LEN..])
}

/// IV, CBC ciphertext and HMAC tag shared by wrapped keys and messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBody {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub mac: [u8; MAC_LEN],
}

impl SealedBody {
    /// Bytes covered by the MAC: header, IV and ciphertext.
    pub fn authenticated_bytes(&self, kind: PayloadKind) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + IV_LEN + self.ciphertext.len());
        out.extend_from_slice(&kind.header());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    fn encode(&self, kind: PayloadKind) -> Vec<u8> {
        let mut out = self.authenticated_bytes(kind);
        out.extend_from_slice(&self.mac);
        out
    }

    fn decode(body: &[u8]) -> Result<Self, CryptoError> {
        if body.len() < IV_LEN + BLOCK_LEN + MAC_LEN {
            return Err(CryptoError::InvalidPayload("sealed payload too short".into()));
        }
        let (iv, rest) = body.split_at(IV_LEN);
        let (ciphertext, mac) = rest.split_at(rest.len() - MAC_LEN);
        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::InvalidPayload(
                "ciphertext is not a whole number of blocks".into(),
            ));
        }
        let mut iv_arr = [0u8; IV_LEN];
        iv_arr.copy_from_slice(iv);
        let mut mac_arr = [0u8; MAC_LEN];
        mac_arr.copy_from_slice(mac);
        Ok(Self {
            iv: iv_arr,
            ciphertext: ciphertext.to_vec(),
            mac: mac_arr,
        })
    }
}

/// A raw key wrapped under one participant's own key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWrapPayload(pub SealedBody);

/// An encrypted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload(pub SealedBody);

impl Payload for KeyWrapPayload {
    const KIND: PayloadKind = PayloadKind::KeyWrap;

    fn to_bytes(&self) -> Vec<u8> {
        self.0.encode(Self::KIND)
    }

    fn parse_body(body: &[u8]) -> Result<Self, CryptoError> {
        SealedBody::decode(body).map(Self)
    }
}

impl Payload for MessagePayload {
    const KIND: PayloadKind = PayloadKind::Message;

    fn to_bytes(&self) -> Vec<u8> {
        self.0.encode(Self::KIND)
    }

    fn parse_body(body: &[u8]) -> Result<Self, CryptoError> {
        SealedBody::decode(body).map(Self)
    }
}

/// The KEM artifact made once per conversation against the recipient's
/// public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulationPayload {
    /// SHA-256 of the public key the artifact was made for.
    pub recipient_fingerprint: [u8; FINGERPRINT_LEN],
    pub kem_ciphertext: Vec<u8>,
    /// Key-confirmation tag derived from the shared secret.
    pub confirmation: [u8; CONFIRMATION_LEN],
}

impl Payload for EncapsulationPayload {
    const KIND: PayloadKind = PayloadKind::Encapsulation;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_LEN + FINGERPRINT_LEN + self.kem_ciphertext.len() + CONFIRMATION_LEN,
        );
        out.extend_from_slice(&Self::KIND.header());
        out.extend_from_slice(&self.recipient_fingerprint);
        out.extend_from_slice(&self.kem_ciphertext);
        out.extend_from_slice(&self.confirmation);
        out
    }

    fn parse_body(body: &[u8]) -> Result<Self, CryptoError> {
        if body.len() != FINGERPRINT_LEN + KEM_CIPHERTEXT_LEN + CONFIRMATION_LEN {
            return Err(CryptoError::InvalidPayload(format!(
                "encapsulation payload must be {} bytes, got {}",
                HEADER_LEN + FINGERPRINT_LEN + KEM_CIPHERTEXT_LEN + CONFIRMATION_LEN,
                body.len() + HEADER_LEN
            )));
        }
        let (fingerprint, rest) = body.split_at(FINGERPRINT_LEN);
        let (kem_ciphertext, confirmation) = rest.split_at(KEM_CIPHERTEXT_LEN);

        let mut recipient_fingerprint = [0u8; FINGERPRINT_LEN];
        recipient_fingerprint.copy_from_slice(fingerprint);
        let mut confirmation_arr = [0u8; CONFIRMATION_LEN];
        confirmation_arr.copy_from_slice(confirmation);

        Ok(Self {
            recipient_fingerprint,
            kem_ciphertext: kem_ciphertext.to_vec(),
            confirmation: confirmation_arr,
        })
    }
}

macro_rules! impl_base64_serde {
    ($name:ident) => {
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_base64())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_base64(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_base64_serde!(KeyWrapPayload);
impl_base64_serde!(MessagePayload);
impl_base64_serde!(EncapsulationPayload);
