//! Conversation key agreement.
//!
//! The initiator encapsulates a fresh shared secret against the recipient's
//! long-term public key. The resulting [`EncapsulationPayload`] is stored once
//! per conversation; every participant keeps their own copy of the secret,
//! wrapped under their own decryption key. No wrapped record is ever usable
//! by another participant.

use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use kemchat_shared::api::conversation::{ConversationStatus, NewConversationRequest};
use kemchat_shared::ids::UserId;

use crate::error::CryptoError;
use crate::identity::{KemPrivateKey, KemPublicKey, SHARED_SECRET_LEN};
use crate::key_wrap::{self, WrappingKey};
use crate::master_key::DecryptionKey;
use crate::payload::{EncapsulationPayload, KeyWrapPayload, Payload, CONFIRMATION_LEN};

const CONFIRMATION_INFO: &[u8] = b"kemchat-key-confirmation-v1";

/// Where a conversation's key lifecycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAgreementState {
    Uninitiated,
    Proposed,
    Accepted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAgreementEvent {
    /// Initiator stored the artifact and their wrapped key.
    Propose,
    /// Self conversation: one participant, one wrap, no request.
    ProposeToSelf,
    Accept,
    Deny,
}

impl std::fmt::Display for KeyAgreementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyAgreementState::Uninitiated => "uninitiated",
            KeyAgreementState::Proposed => "proposed",
            KeyAgreementState::Accepted => "accepted",
            KeyAgreementState::Denied => "denied",
        };
        f.write_str(name)
    }
}

impl std::fmt::Display for KeyAgreementEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyAgreementEvent::Propose => "propose",
            KeyAgreementEvent::ProposeToSelf => "propose_to_self",
            KeyAgreementEvent::Accept => "accept",
            KeyAgreementEvent::Deny => "deny",
        };
        f.write_str(name)
    }
}

impl KeyAgreementState {
    /// Apply `event`, or fail with `InvalidTransition` and leave the state
    /// untouched.
    pub fn apply(self, event: KeyAgreementEvent) -> Result<Self, CryptoError> {
        use KeyAgreementEvent as E;
        use KeyAgreementState as S;

        match (self, event) {
            (S::Uninitiated, E::Propose) => Ok(S::Proposed),
            (S::Uninitiated, E::ProposeToSelf) => Ok(S::Accepted),
            (S::Proposed, E::Accept) => Ok(S::Accepted),
            (S::Proposed, E::Deny) => Ok(S::Denied),
            (from, event) => Err(CryptoError::InvalidTransition {
                from: from.to_string(),
                event: event.to_string(),
            }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, KeyAgreementState::Accepted | KeyAgreementState::Denied)
    }

    /// Wire status of a stored conversation. `Uninitiated` has none.
    pub fn status(self) -> Option<ConversationStatus> {
        match self {
            KeyAgreementState::Uninitiated => None,
            KeyAgreementState::Proposed => Some(ConversationStatus::Pending),
            KeyAgreementState::Accepted => Some(ConversationStatus::Accepted),
            KeyAgreementState::Denied => Some(ConversationStatus::Denied),
        }
    }
}

impl From<ConversationStatus> for KeyAgreementState {
    fn from(status: ConversationStatus) -> Self {
        match status {
            ConversationStatus::Pending => KeyAgreementState::Proposed,
            ConversationStatus::Accepted => KeyAgreementState::Accepted,
            ConversationStatus::Denied => KeyAgreementState::Denied,
        }
    }
}

/// The symmetric key for one conversation. Held in memory only.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey {
    key: [u8; SHARED_SECRET_LEN],
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ConversationKey {
    /// Random key for a self conversation, which has no second party to
    /// encapsulate against.
    pub fn generate() -> Self {
        let mut key = [0u8; SHARED_SECRET_LEN];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; SHARED_SECRET_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "conversation key must be {SHARED_SECRET_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.key
    }
}

impl WrappingKey for ConversationKey {
    fn key_bytes(&self) -> &[u8] {
        &self.key
    }
}

fn confirmation_tag(
    secret: &[u8; SHARED_SECRET_LEN],
    kem_ciphertext: &[u8],
) -> Result<[u8; CONFIRMATION_LEN], hkdf::InvalidLength> {
    let hk = Hkdf::<Sha256>::new(Some(kem_ciphertext), secret);
    let mut tag = [0u8; CONFIRMATION_LEN];
    hk.expand(CONFIRMATION_INFO, &mut tag)?;
    Ok(tag)
}

/// Output of [`initiate`]: the shared artifact and the initiator's own
/// wrapped copy of the secret.
#[derive(Debug, Clone)]
pub struct InitiatedConversation {
    pub artifact: EncapsulationPayload,
    pub wrapped_key: KeyWrapPayload,
}

impl InitiatedConversation {
    pub fn to_request(&self, participants: Vec<UserId>) -> NewConversationRequest {
        NewConversationRequest {
            participants,
            encapsulation: self.artifact.to_base64(),
            wrapped_key: self.wrapped_key.to_base64(),
        }
    }
}

/// Encapsulate a new conversation secret against `recipient` and wrap it for
/// the initiator.
pub fn initiate(
    recipient: &KemPublicKey,
    decryption_key: &DecryptionKey,
) -> Result<InitiatedConversation, CryptoError> {
    let (kem_ciphertext, secret) = recipient.encapsulate()?;
    let confirmation = confirmation_tag(&secret, &kem_ciphertext)
        .map_err(|e| CryptoError::Encapsulation(e.to_string()))?;

    let wrapped_key = key_wrap::wrap_key(&secret[..], decryption_key)?;
    let artifact = EncapsulationPayload {
        recipient_fingerprint: recipient.fingerprint(),
        kem_ciphertext,
        confirmation,
    };

    tracing::debug!(
        recipient = %recipient.fingerprint_display(),
        "conversation key encapsulated"
    );
    Ok(InitiatedConversation {
        artifact,
        wrapped_key,
    })
}

/// Recover the conversation key from `artifact` with the recipient's private
/// key.
///
/// Fails with `CryptoError::Decapsulation` when the artifact was made for a
/// different public key or its confirmation tag does not match, so a wrong
/// key never produces a silently incorrect secret.
pub fn open_artifact(
    artifact: &EncapsulationPayload,
    private_key: &KemPrivateKey,
) -> Result<ConversationKey, CryptoError> {
    let own_fingerprint = private_key.public_key().fingerprint();
    if !bool::from(own_fingerprint[..].ct_eq(&artifact.recipient_fingerprint[..])) {
        tracing::warn!("artifact addressed to a different public key");
        return Err(CryptoError::Decapsulation(
            "artifact was made for a different public key".into(),
        ));
    }

    let secret = private_key.decapsulate(&artifact.kem_ciphertext)?;
    let expected = confirmation_tag(&secret, &artifact.kem_ciphertext)
        .map_err(|e| CryptoError::Decapsulation(e.to_string()))?;
    if !bool::from(expected[..].ct_eq(&artifact.confirmation[..])) {
        tracing::warn!("artifact key confirmation failed");
        return Err(CryptoError::Decapsulation("key confirmation failed".into()));
    }

    ConversationKey::from_bytes(&secret[..])
}

/// Decapsulate `artifact` and wrap the recovered secret under the accepter's
/// own decryption key. Nothing is produced on failure.
pub fn accept(
    artifact: &EncapsulationPayload,
    private_key: &KemPrivateKey,
    decryption_key: &DecryptionKey,
) -> Result<KeyWrapPayload, CryptoError> {
    let key = open_artifact(artifact, private_key)?;
    let wrapped = key_wrap::wrap_key(key.as_bytes(), decryption_key)?;
    tracing::debug!("conversation key accepted");
    Ok(wrapped)
}

/// Wrap a fresh random key for a conversation with oneself.
pub fn initiate_self(
    decryption_key: &DecryptionKey,
) -> Result<(ConversationKey, KeyWrapPayload), CryptoError> {
    let key = ConversationKey::generate();
    let wrapped = key_wrap::wrap_key(key.as_bytes(), decryption_key)?;
    Ok((key, wrapped))
}

/// Unwrap the caller's own record for a conversation.
pub fn unwrap_conversation_key(
    wrapped: &KeyWrapPayload,
    decryption_key: &DecryptionKey,
) -> Result<ConversationKey, CryptoError> {
    let raw = key_wrap::decrypt_key(wrapped, decryption_key)?;
    ConversationKey::from_bytes(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_keypair;

    fn decryption_key(byte: u8) -> DecryptionKey {
        DecryptionKey::from_bytes([byte; 16])
    }

    #[test]
    fn initiator_and_accepter_unwrap_identical_secret() {
        let bob = generate_keypair();
        let alice_key = decryption_key(1);
        let bob_key = decryption_key(2);

        let initiated = initiate(&bob.public_key, &alice_key).unwrap();
        let wrapped_for_bob = accept(&initiated.artifact, &bob.private_key, &bob_key).unwrap();

        let alice_secret = unwrap_conversation_key(&initiated.wrapped_key, &alice_key).unwrap();
        let bob_secret = unwrap_conversation_key(&wrapped_for_bob, &bob_key).unwrap();
        assert_eq!(alice_secret.as_bytes(), bob_secret.as_bytes());
    }

    #[test]
    fn wrapped_records_are_bound_to_their_owner() {
        let bob = generate_keypair();
        let alice_key = decryption_key(3);
        let bob_key = decryption_key(4);

        let initiated = initiate(&bob.public_key, &alice_key).unwrap();
        let wrapped_for_bob = accept(&initiated.artifact, &bob.private_key, &bob_key).unwrap();

        assert!(unwrap_conversation_key(&initiated.wrapped_key, &bob_key).is_err());
        assert!(unwrap_conversation_key(&wrapped_for_bob, &alice_key).is_err());
    }

    #[test]
    fn mismatched_private_key_fails_with_decapsulation_error() {
        let bob = generate_keypair();
        let mallory = generate_keypair();
        let initiated = initiate(&bob.public_key, &decryption_key(5)).unwrap();

        let result = accept(&initiated.artifact, &mallory.private_key, &decryption_key(6));
        assert!(matches!(result, Err(CryptoError::Decapsulation(_))));
    }

    #[test]
    fn readdressed_artifact_fails_key_confirmation() {
        let bob = generate_keypair();
        let mallory = generate_keypair();
        let mut artifact = initiate(&bob.public_key, &decryption_key(7))
            .unwrap()
            .artifact;
        artifact.recipient_fingerprint = mallory.public_key.fingerprint();

        let err = open_artifact(&artifact, &mallory.private_key).unwrap_err();
        assert!(matches!(err, CryptoError::Decapsulation(_)));
        assert!(err.to_string().contains("confirmation"));
    }

    #[test]
    fn corrupted_kem_ciphertext_fails_with_decapsulation_error() {
        let bob = generate_keypair();
        let mut artifact = initiate(&bob.public_key, &decryption_key(8))
            .unwrap()
            .artifact;
        artifact.kem_ciphertext[10] ^= 0xFF;

        let result = accept(&artifact, &bob.private_key, &decryption_key(9));
        assert!(matches!(result, Err(CryptoError::Decapsulation(_))));
    }

    #[test]
    fn artifact_records_recipient_fingerprint() {
        let bob = generate_keypair();
        let initiated = initiate(&bob.public_key, &decryption_key(10)).unwrap();
        assert_eq!(
            initiated.artifact.recipient_fingerprint,
            bob.public_key.fingerprint()
        );
    }

    #[test]
    fn self_conversation_key_unwraps_for_its_owner() {
        let key = decryption_key(11);
        let (conversation_key, wrapped) = initiate_self(&key).unwrap();
        let unwrapped = unwrap_conversation_key(&wrapped, &key).unwrap();
        assert_eq!(unwrapped.as_bytes(), conversation_key.as_bytes());
    }

    #[test]
    fn request_payload_uses_base64_encodings() {
        let bob = generate_keypair();
        let initiated = initiate(&bob.public_key, &decryption_key(12)).unwrap();
        let participants = vec![UserId::new(), UserId::new()];
        let request = initiated.to_request(participants.clone());
        assert_eq!(request.participants, participants);
        assert_eq!(
            EncapsulationPayload::from_base64(&request.encapsulation).unwrap(),
            initiated.artifact
        );
        assert_eq!(
            KeyWrapPayload::from_base64(&request.wrapped_key).unwrap(),
            initiated.wrapped_key
        );
    }

    #[test]
    fn proposed_request_can_be_accepted_or_denied() {
        let proposed = KeyAgreementState::Uninitiated
            .apply(KeyAgreementEvent::Propose)
            .unwrap();
        assert_eq!(proposed, KeyAgreementState::Proposed);
        assert_eq!(
            proposed.apply(KeyAgreementEvent::Accept).unwrap(),
            KeyAgreementState::Accepted
        );
        assert_eq!(
            proposed.apply(KeyAgreementEvent::Deny).unwrap(),
            KeyAgreementState::Denied
        );
    }

    #[test]
    fn self_conversation_skips_the_request() {
        let state = KeyAgreementState::Uninitiated
            .apply(KeyAgreementEvent::ProposeToSelf)
            .unwrap();
        assert_eq!(state, KeyAgreementState::Accepted);
    }

    #[test]
    fn terminal_states_reject_further_events() {
        for state in [KeyAgreementState::Accepted, KeyAgreementState::Denied] {
            assert!(state.is_terminal());
            for event in [
                KeyAgreementEvent::Propose,
                KeyAgreementEvent::ProposeToSelf,
                KeyAgreementEvent::Accept,
                KeyAgreementEvent::Deny,
            ] {
                assert!(matches!(
                    state.apply(event),
                    Err(CryptoError::InvalidTransition { .. })
                ));
            }
        }
    }

    #[test]
    fn uninitiated_cannot_be_accepted() {
        let err = KeyAgreementState::Uninitiated
            .apply(KeyAgreementEvent::Accept)
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid transition from uninitiated on accept");
    }

    #[test]
    fn state_maps_to_wire_status() {
        assert_eq!(KeyAgreementState::Uninitiated.status(), None);
        for status in [
            ConversationStatus::Pending,
            ConversationStatus::Accepted,
            ConversationStatus::Denied,
        ] {
            assert_eq!(KeyAgreementState::from(status).status(), Some(status));
        }
    }

    #[test]
    fn conversation_key_rejects_wrong_length() {
        assert!(ConversationKey::from_bytes(&[0u8; 16]).is_err());
        assert!(ConversationKey::from_bytes(&[0u8; 32]).is_ok());
    }
}
