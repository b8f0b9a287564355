//! `ConversationStore` on SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use kemchat_shared::api::conversation::ConversationStatus;
use kemchat_shared::ids::{ConversationId, UserId};

use super::{conversion_error, id_column, now_millis, payload_column, timestamp_column, SqliteStore};
use crate::agreement::{KeyAgreementEvent, KeyAgreementState};
use crate::error::CryptoError;
use crate::payload::{EncapsulationPayload, KeyWrapPayload, Payload};
use crate::store::{ConversationRecord, ConversationStore, NewConversation};

fn status_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<ConversationStatus> {
    let tag: String = row.get(idx)?;
    ConversationStatus::from_tag(&tag).ok_or_else(|| {
        conversion_error(
            idx,
            rusqlite::types::Type::Text,
            CryptoError::InvalidPayload(format!("unknown conversation status {tag}")),
        )
    })
}

fn validate_new(conversation: &NewConversation) -> Result<(), CryptoError> {
    let participants = &conversation.participants;
    if !participants.contains(&conversation.initiator_id) {
        return Err(CryptoError::InvalidPayload(
            "initiator must be a participant".into(),
        ));
    }
    let is_self = participants.len() == 1;
    match (conversation.status, &conversation.artifact) {
        (ConversationStatus::Pending, Some(_)) if !is_self => Ok(()),
        (ConversationStatus::Accepted, None) if is_self => Ok(()),
        (status, _) => Err(CryptoError::InvalidPayload(format!(
            "cannot create a {} conversation with {} participant(s) {} an artifact",
            status.as_str(),
            participants.len(),
            if conversation.artifact.is_some() { "and" } else { "without" }
        ))),
    }
}

fn load_participants(conn: &Connection, id: ConversationId) -> Result<Vec<UserId>, CryptoError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants
         WHERE conversation_id = ?1 ORDER BY position",
    )?;
    let participants = stmt
        .query_map([id.to_string()], |row| id_column(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(participants)
}

fn load_conversation(conn: &Connection, id: ConversationId) -> Result<ConversationRecord, CryptoError> {
    let (initiator_id, status, created_at): (UserId, ConversationStatus, DateTime<Utc>) = conn
        .query_row(
            "SELECT initiator_id, status, created_at FROM conversations WHERE id = ?1",
            [id.to_string()],
            |row| {
                Ok((
                    id_column(row, 0)?,
                    status_column(row, 1)?,
                    timestamp_column(row, 2)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| CryptoError::NotFound(format!("conversation {id}")))?;

    Ok(ConversationRecord {
        id,
        initiator_id,
        participants: load_participants(conn, id)?,
        status,
        created_at,
    })
}

/// Check the transition and the caller's role, returning the new status.
fn transition(
    record: &ConversationRecord,
    participant_id: UserId,
    event: KeyAgreementEvent,
) -> Result<ConversationStatus, CryptoError> {
    if !record.is_participant(participant_id) || record.initiator_id == participant_id {
        return Err(CryptoError::NotFound(format!(
            "pending request for {participant_id} in conversation {}",
            record.id
        )));
    }
    let next = KeyAgreementState::from(record.status).apply(event)?;
    next.status()
        .ok_or_else(|| CryptoError::StorageError("transition produced no status".into()))
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create(&self, conversation: NewConversation) -> Result<ConversationId, CryptoError> {
        validate_new(&conversation)?;
        let id = ConversationId::new();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let now = now_millis();
            tx.execute(
                "INSERT INTO conversations (id, initiator_id, status, artifact, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    conversation.initiator_id.to_string(),
                    conversation.status.as_str(),
                    conversation.artifact.as_ref().map(|a| a.to_bytes()),
                    now,
                ],
            )?;
            for (position, user_id) in conversation.participants.iter().enumerate() {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![id.to_string(), user_id.to_string(), position as i64],
                )?;
            }
            tx.execute(
                "INSERT INTO conversation_keys (conversation_id, user_id, wrapped_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    conversation.initiator_id.to_string(),
                    conversation.initiator_wrapped_key.to_bytes(),
                    now,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        tracing::debug!(
            conversation_id = %id,
            participants = conversation.participants.len(),
            status = conversation.status.as_str(),
            "conversation created"
        );
        Ok(id)
    }

    async fn record_acceptance(
        &self,
        conversation_id: ConversationId,
        participant_id: UserId,
        wrapped_key: KeyWrapPayload,
    ) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let record = load_conversation(&tx, conversation_id)?;
            let status = transition(&record, participant_id, KeyAgreementEvent::Accept)?;

            tx.execute(
                "INSERT INTO conversation_keys (conversation_id, user_id, wrapped_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    conversation_id.to_string(),
                    participant_id.to_string(),
                    wrapped_key.to_bytes(),
                    now_millis(),
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET status = ?1 WHERE id = ?2",
                params![status.as_str(), conversation_id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        tracing::debug!(%conversation_id, %participant_id, "conversation accepted");
        Ok(())
    }

    async fn record_denial(&self, conversation_id: ConversationId) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let record = load_conversation(&tx, conversation_id)?;
            let next = KeyAgreementState::from(record.status).apply(KeyAgreementEvent::Deny)?;
            let status = next
                .status()
                .ok_or_else(|| CryptoError::StorageError("transition produced no status".into()))?;
            tx.execute(
                "UPDATE conversations SET status = ?1 WHERE id = ?2",
                params![status.as_str(), conversation_id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        tracing::debug!(%conversation_id, "conversation denied");
        Ok(())
    }

    async fn fetch_artifact(
        &self,
        conversation_id: ConversationId,
    ) -> Result<EncapsulationPayload, CryptoError> {
        self.with_conn(|conn| {
            let artifact: Option<Option<EncapsulationPayload>> = conn
                .query_row(
                    "SELECT artifact FROM conversations WHERE id = ?1",
                    [conversation_id.to_string()],
                    |row| match row.get_ref(0)? {
                        rusqlite::types::ValueRef::Null => Ok(None),
                        _ => payload_column(row, 0).map(Some),
                    },
                )
                .optional()?;
            match artifact {
                Some(Some(artifact)) => Ok(artifact),
                Some(None) => Err(CryptoError::NotFound(format!(
                    "conversation {conversation_id} has no artifact"
                ))),
                None => Err(CryptoError::NotFound(format!(
                    "conversation {conversation_id}"
                ))),
            }
        })
    }

    async fn fetch_wrapped_key(
        &self,
        conversation_id: ConversationId,
        participant_id: UserId,
    ) -> Result<KeyWrapPayload, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT wrapped_key FROM conversation_keys
                 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), participant_id.to_string()],
                |row| payload_column(row, 0),
            )
            .optional()?
            .ok_or_else(|| {
                CryptoError::NotFound(format!(
                    "wrapped key for {participant_id} in conversation {conversation_id}"
                ))
            })
        })
    }

    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationRecord, CryptoError> {
        self.with_conn(|conn| load_conversation(conn, conversation_id))
    }

    async fn list_for_participant(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationRecord>, CryptoError> {
        self.with_conn(|conn| {
            let ids: Vec<ConversationId> = {
                let mut stmt = conn.prepare(
                    "SELECT c.id FROM conversations c
                     JOIN conversation_participants p ON p.conversation_id = c.id
                     WHERE p.user_id = ?1
                     ORDER BY c.created_at DESC, c.rowid DESC",
                )?;
                let rows = stmt.query_map([user_id.to_string()], |row| id_column(row, 0))?;
                rows.collect::<Result<_, _>>()?
            };
            ids.into_iter()
                .map(|id| load_conversation(conn, id))
                .collect()
        })
    }
}
