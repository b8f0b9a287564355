//! Persistence seams consumed by the key service.
//!
//! The server stores only public keys, wrapped keys, artifacts and message
//! ciphertext. Implementations must make each write atomic so a failed or
//! cancelled operation never leaves a half-written record.

use chrono::{DateTime, Utc};

use kemchat_shared::api::conversation::{ConversationResponse, ConversationStatus};
use kemchat_shared::api::message::{MessagePageQuery, MessageResponse};
use kemchat_shared::constants::DEFAULT_MESSAGE_PAGE_SIZE;
use kemchat_shared::ids::{ConversationId, MessageId, UserId};

use crate::error::CryptoError;
use crate::identity::KemPublicKey;
use crate::master_key::Salt;
use crate::payload::{EncapsulationPayload, KeyWrapPayload, MessagePayload, Payload};

/// The key material published for one user.
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub user_id: UserId,
    pub public_key: KemPublicKey,
    pub encrypted_private_key: KeyWrapPayload,
    pub salt: Salt,
}

/// A registered user as the directory holds it.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub public_key: KemPublicKey,
    pub encrypted_private_key: KeyWrapPayload,
    pub salt: Salt,
    /// PHC hash of the authentication key.
    pub verifier: String,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn identity(&self) -> StoredIdentity {
        StoredIdentity {
            user_id: self.id,
            public_key: self.public_key.clone(),
            encrypted_private_key: self.encrypted_private_key.clone(),
            salt: self.salt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub initiator_id: UserId,
    /// All participants, initiator included.
    pub participants: Vec<UserId>,
    /// `None` for a self conversation.
    pub artifact: Option<EncapsulationPayload>,
    pub initiator_wrapped_key: KeyWrapPayload,
    pub status: ConversationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub initiator_id: UserId,
    pub participants: Vec<UserId>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn to_response(&self) -> ConversationResponse {
        ConversationResponse {
            id: self.id,
            initiator_id: self.initiator_id,
            participants: self.participants.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredMessageMeta {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub ciphertext: MessagePayload,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn to_response(&self) -> MessageResponse {
        MessageResponse {
            id: self.id,
            conversation_id: self.conversation_id,
            author_id: self.author_id,
            ciphertext: self.ciphertext.to_base64(),
            created_at: self.created_at,
        }
    }
}

/// One page of history. Pages start at 1; page 1 is the newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            number: 1,
            limit: DEFAULT_MESSAGE_PAGE_SIZE,
        }
    }
}

impl Page {
    pub fn new(number: u32, limit: u32) -> Self {
        MessagePageQuery {
            page: number,
            limit,
        }
        .into()
    }

    pub fn offset(&self) -> u64 {
        MessagePageQuery::from(*self).offset()
    }
}

impl From<MessagePageQuery> for Page {
    fn from(query: MessagePageQuery) -> Self {
        let query = query.normalized();
        Self {
            number: query.page,
            limit: query.limit,
        }
    }
}

impl From<Page> for MessagePageQuery {
    fn from(page: Page) -> Self {
        MessagePageQuery {
            page: page.number,
            limit: page.limit,
        }
    }
}

#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// Register a user. Fails with `StorageError` if the username is taken.
    async fn store(&self, user: UserRecord) -> Result<(), CryptoError>;
    async fn lookup(&self, user_id: UserId) -> Result<StoredIdentity, CryptoError>;
    async fn lookup_by_username(&self, username: &str) -> Result<UserRecord, CryptoError>;
}

#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Store the conversation, its artifact and the initiator's wrapped key
    /// in one write.
    async fn create(&self, conversation: NewConversation) -> Result<ConversationId, CryptoError>;
    /// Store the accepter's wrapped key and mark the conversation accepted.
    /// Fails with `InvalidTransition` unless the conversation is pending.
    async fn record_acceptance(
        &self,
        conversation_id: ConversationId,
        participant_id: UserId,
        wrapped_key: KeyWrapPayload,
    ) -> Result<(), CryptoError>;
    /// Mark a pending conversation denied. No key material is written.
    async fn record_denial(&self, conversation_id: ConversationId) -> Result<(), CryptoError>;
    async fn fetch_artifact(
        &self,
        conversation_id: ConversationId,
    ) -> Result<EncapsulationPayload, CryptoError>;
    async fn fetch_wrapped_key(
        &self,
        conversation_id: ConversationId,
        participant_id: UserId,
    ) -> Result<KeyWrapPayload, CryptoError>;
    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationRecord, CryptoError>;
    /// Conversations `user_id` takes part in, newest first.
    async fn list_for_participant(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationRecord>, CryptoError>;
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        ciphertext: MessagePayload,
    ) -> Result<StoredMessageMeta, CryptoError>;
    /// One page of messages, newest first.
    async fn list(
        &self,
        conversation_id: ConversationId,
        page: Page,
    ) -> Result<Vec<StoredMessage>, CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kemchat_shared::constants::MAX_MESSAGE_PAGE_SIZE;

    #[test]
    fn default_page_is_first_page_of_twenty() {
        let page = Page::default();
        assert_eq!(page.number, 1);
        assert_eq!(page.limit, 20);
        assert_eq!(page.offset(), 0);
    }

    #[test]
    fn page_new_clamps_out_of_range_values() {
        let page = Page::new(0, 1000);
        assert_eq!(page.number, 1);
        assert_eq!(page.limit, MAX_MESSAGE_PAGE_SIZE);
    }

    #[test]
    fn page_offset_skips_earlier_pages() {
        assert_eq!(Page::new(3, 10).offset(), 20);
    }

    #[test]
    fn conversation_record_knows_its_participants() {
        let alice = UserId::new();
        let record = ConversationRecord {
            id: ConversationId::new(),
            initiator_id: alice,
            participants: vec![alice],
            status: ConversationStatus::Accepted,
            created_at: Utc::now(),
        };
        assert!(record.is_participant(alice));
        assert!(!record.is_participant(UserId::new()));
        assert_eq!(record.to_response().participants, vec![alice]);
    }
}
