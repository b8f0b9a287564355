use crate::constants::{DEFAULT_MESSAGE_PAGE_SIZE, MAX_MESSAGE_PAGE_SIZE};
use crate::ids::{ConversationId, MessageId, UserId};
use serde::{Deserialize, Serialize};

/// Request to store an encrypted message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessageRequest {
    pub conversation_id: ConversationId,
    pub ciphertext: String,
}

/// Stored message as relayed by the server: ciphertext only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub ciphertext: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// History page query. Pages start at 1; page 1 holds the newest messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MessagePageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}
fn default_limit() -> u32 {
    DEFAULT_MESSAGE_PAGE_SIZE
}

impl Default for MessagePageQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl MessagePageQuery {
    /// Clamp to a valid page (>= 1) and limit (1..=MAX_MESSAGE_PAGE_SIZE).
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_MESSAGE_PAGE_SIZE),
        }
    }

    /// Row offset of the first message on this page.
    pub fn offset(&self) -> u64 {
        let q = self.normalized();
        u64::from(q.page - 1) * u64::from(q.limit)
    }
}
