//! `MessageStore` on SQLite. History is returned newest first.

use async_trait::async_trait;
use chrono::DateTime;
use rusqlite::params;

use kemchat_shared::ids::{ConversationId, MessageId, UserId};

use super::{id_column, now_millis, payload_column, timestamp_column, SqliteStore};
use crate::error::CryptoError;
use crate::payload::{MessagePayload, Payload};
use crate::store::{MessageStore, Page, StoredMessage, StoredMessageMeta};

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        ciphertext: MessagePayload,
    ) -> Result<StoredMessageMeta, CryptoError> {
        let id = MessageId::new();
        let millis = now_millis();
        let created_at = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| CryptoError::StorageError("clock out of range".into()))?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, author_id, ciphertext, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    conversation_id.to_string(),
                    author_id.to_string(),
                    ciphertext.to_bytes(),
                    millis,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        Ok(StoredMessageMeta { id, created_at })
    }

    async fn list(
        &self,
        conversation_id: ConversationId,
        page: Page,
    ) -> Result<Vec<StoredMessage>, CryptoError> {
        let page = Page::new(page.number, page.limit);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, author_id, ciphertext, created_at FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY seq DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(
                params![
                    conversation_id.to_string(),
                    i64::from(page.limit),
                    page.offset() as i64
                ],
                |row| {
                    Ok(StoredMessage {
                        id: id_column(row, 0)?,
                        conversation_id: id_column(row, 1)?,
                        author_id: id_column(row, 2)?,
                        ciphertext: payload_column(row, 3)?,
                        created_at: timestamp_column(row, 4)?,
                    })
                },
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}
