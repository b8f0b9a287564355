//! `UserDirectory` on SQLite.

use async_trait::async_trait;
use rusqlite::{params, ErrorCode, OptionalExtension};

use kemchat_shared::ids::UserId;

use super::{conversion_error, id_column, payload_column, timestamp_column, SqliteStore};
use crate::error::CryptoError;
use crate::identity::KemPublicKey;
use crate::master_key::Salt;
use crate::payload::Payload;
use crate::store::{StoredIdentity, UserDirectory, UserRecord};

const USER_COLUMNS: &str =
    "id, username, display_name, public_key, encrypted_private_key, salt, verifier, created_at";

fn public_key_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<KemPublicKey> {
    let bytes: Vec<u8> = row.get(idx)?;
    KemPublicKey::from_bytes(&bytes).map_err(|e| conversion_error(idx, rusqlite::types::Type::Blob, e))
}

fn salt_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Salt> {
    let bytes: Vec<u8> = row.get(idx)?;
    let array = bytes.as_slice().try_into().map_err(|_| {
        conversion_error(
            idx,
            rusqlite::types::Type::Blob,
            CryptoError::InvalidKey("stored salt has wrong length".into()),
        )
    })?;
    Ok(Salt::from_bytes(array))
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: id_column(row, 0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        public_key: public_key_column(row, 3)?,
        encrypted_private_key: payload_column(row, 4)?,
        salt: salt_column(row, 5)?,
        verifier: row.get(6)?,
        created_at: timestamp_column(row, 7)?,
    })
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn store(&self, user: UserRecord) -> Result<(), CryptoError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                &format!("INSERT INTO users ({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    user.id.to_string(),
                    user.username,
                    user.display_name,
                    user.public_key.as_bytes(),
                    user.encrypted_private_key.to_bytes(),
                    user.salt.as_bytes().as_slice(),
                    user.verifier,
                    user.created_at.timestamp_millis(),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(CryptoError::Conflict(format!(
                        "username {} is taken",
                        user.username
                    )));
                }
                Err(e) => return Err(e.into()),
            }
            tx.commit()?;
            tracing::debug!(user_id = %user.id, "user stored");
            Ok(())
        })
    }

    async fn lookup(&self, user_id: UserId) -> Result<StoredIdentity, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [user_id.to_string()],
                user_from_row,
            )
            .optional()?
            .map(|user| user.identity())
            .ok_or_else(|| CryptoError::NotFound(format!("user {user_id}")))
        })
    }

    async fn lookup_by_username(&self, username: &str) -> Result<UserRecord, CryptoError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                [username],
                user_from_row,
            )
            .optional()?
            .ok_or_else(|| CryptoError::NotFound(format!("username {username}")))
        })
    }
}
