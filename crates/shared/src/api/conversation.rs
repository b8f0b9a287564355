use crate::ids::{ConversationId, UserId};
use serde::{Deserialize, Serialize};

/// Lifecycle of a conversation request as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Pending,
    Accepted,
    Denied,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Pending => "PENDING",
            ConversationStatus::Accepted => "ACCEPTED",
            ConversationStatus::Denied => "DENIED",
        }
    }

    /// Parse the stored/wire tag. Matching is case-sensitive.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "PENDING" => Some(ConversationStatus::Pending),
            "ACCEPTED" => Some(ConversationStatus::Accepted),
            "DENIED" => Some(ConversationStatus::Denied),
            _ => None,
        }
    }
}

/// Request to open a conversation. `encapsulation` is the KEM artifact made
/// against the recipient's public key; `wrapped_key` is the initiator's own
/// wrapped copy of the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConversationRequest {
    pub participants: Vec<UserId>,
    pub encapsulation: String,
    pub wrapped_key: String,
}

/// Request to accept a pending conversation with the accepter's wrapped key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptConversationRequest {
    pub wrapped_key: String,
}

/// Conversation summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub id: ConversationId,
    pub initiator_id: UserId,
    pub participants: Vec<UserId>,
    pub status: ConversationStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&ConversationStatus::Pending).unwrap();
        assert_eq!(json, "\"PENDING\"");
    }

    #[test]
    fn status_tags_round_trip() {
        for status in [
            ConversationStatus::Pending,
            ConversationStatus::Accepted,
            ConversationStatus::Denied,
        ] {
            assert_eq!(ConversationStatus::from_tag(status.as_str()), Some(status));
        }
        assert_eq!(ConversationStatus::from_tag("pending"), None);
    }

    #[test]
    fn new_conversation_request_serde() {
        let req = NewConversationRequest {
            participants: vec![UserId::new()],
            encapsulation: "ct".into(),
            wrapped_key: "wk".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: NewConversationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.participants.len(), 1);
        assert_eq!(back.encapsulation, "ct");
    }
}
