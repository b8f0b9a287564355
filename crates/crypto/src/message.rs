//! Message encryption under a conversation key.
//!
//! Plaintext is UTF-8 encoded, PKCS#7 padded and encrypted with AES-256-CBC
//! under a fresh IV, then authenticated (see [`crate::key_wrap`]). A message
//! that fails to decrypt is never shown partially; it is rendered as
//! [`DisplayMessage::Undecryptable`].

use chrono::{DateTime, Utc};

use kemchat_shared::constants::MAX_MESSAGE_SIZE_BYTES;
use kemchat_shared::ids::{MessageId, UserId};

use crate::agreement::ConversationKey;
use crate::error::CryptoError;
use crate::key_wrap::{self, WrappingKey};
use crate::payload::{MessagePayload, PayloadKind};
use crate::store::StoredMessage;

/// Text shown in place of a message that could not be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt message]";

/// Encrypt `plaintext` under the conversation key.
pub fn encrypt_message(
    plaintext: &str,
    key: &ConversationKey,
) -> Result<MessagePayload, CryptoError> {
    if plaintext.len() > MAX_MESSAGE_SIZE_BYTES {
        return Err(CryptoError::InvalidPayload(format!(
            "message exceeds {MAX_MESSAGE_SIZE_BYTES} bytes"
        )));
    }
    key_wrap::seal(
        PayloadKind::Message,
        key.key_bytes(),
        key_wrap::generate_iv(),
        plaintext.as_bytes(),
    )
    .map(MessagePayload)
    .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Decrypt a message. Any integrity, padding or encoding failure is a
/// `CryptoError::Decryption`.
pub fn decrypt_message(
    payload: &MessagePayload,
    key: &ConversationKey,
) -> Result<String, CryptoError> {
    let bytes = key_wrap::open(PayloadKind::Message, key.key_bytes(), &payload.0).map_err(|e| {
        tracing::warn!(error = %e, "message rejected");
        CryptoError::Decryption(e.to_string())
    })?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| CryptoError::Decryption("message is not valid UTF-8".into()))
}

/// A stored message as the client presents it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayMessage {
    Plaintext {
        id: MessageId,
        author_id: UserId,
        text: String,
        created_at: DateTime<Utc>,
    },
    Undecryptable {
        id: MessageId,
        author_id: UserId,
        created_at: DateTime<Utc>,
    },
}

impl DisplayMessage {
    /// Decrypt `stored` when a key is available; otherwise, or on failure,
    /// produce the placeholder.
    pub fn render(stored: &StoredMessage, key: Option<&ConversationKey>) -> Self {
        let decrypted = key.map(|k| decrypt_message(&stored.ciphertext, k));
        match decrypted {
            Some(Ok(text)) => DisplayMessage::Plaintext {
                id: stored.id,
                author_id: stored.author_id,
                text,
                created_at: stored.created_at,
            },
            _ => DisplayMessage::Undecryptable {
                id: stored.id,
                author_id: stored.author_id,
                created_at: stored.created_at,
            },
        }
    }

    pub fn id(&self) -> MessageId {
        match self {
            DisplayMessage::Plaintext { id, .. } | DisplayMessage::Undecryptable { id, .. } => *id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            DisplayMessage::Plaintext { text, .. } => text,
            DisplayMessage::Undecryptable { .. } => UNDECRYPTABLE_PLACEHOLDER,
        }
    }

    pub fn is_undecryptable(&self) -> bool {
        matches!(self, DisplayMessage::Undecryptable { .. })
    }
}
