//! SQLite implementation of the store traits.
//!
//! One connection behind a `std::sync::Mutex`. The lock is never held across
//! an `.await`; every trait method does its SQL synchronously and each write
//! runs in a single transaction.

mod conversation_store;
pub mod migrations;
mod message_store;
mod user_directory;

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;

use crate::config::CryptoConfig;
use crate::error::CryptoError;
use crate::payload::Payload;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn configure_connection(conn: &Connection) -> Result<(), CryptoError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(())
}

impl SqliteStore {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, CryptoError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CryptoError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// File-backed when `database_path` is set, in-memory otherwise.
    pub fn from_config(config: &CryptoConfig) -> Result<Self, CryptoError> {
        match &config.database_path {
            Some(path) => Self::open(path),
            None => Self::open_in_memory(),
        }
    }

    fn init(conn: Connection) -> Result<Self, CryptoError> {
        configure_connection(&conn)?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| CryptoError::StorageError(e.to_string()))?;
        f(&mut conn)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn conversion_error(
    idx: usize,
    ty: Type,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
}

/// Read a typed id stored as TEXT.
fn id_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, Type::Text, e))
}

fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(
        idx, millis,
    ))
}

/// Read a payload stored as its binary encoding.
fn payload_column<P: Payload>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<P> {
    let bytes: Vec<u8> = row.get(idx)?;
    P::from_bytes(&bytes).map_err(|e| conversion_error(idx, Type::Blob, e))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_enables_foreign_keys() {
        let store = SqliteStore::open_in_memory().unwrap();
        let fk: i64 = store
            .with_conn(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kemchat.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .with_conn(|conn| {
                    conn.execute(
                        "INSERT INTO users (id, username, display_name, public_key,
                             encrypted_private_key, salt, verifier, created_at)
                         VALUES ('x', 'persisted', 'P', x'00', x'00', x'00', 'v', 0)",
                        [],
                    )?;
                    Ok(())
                })
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn from_config_without_path_is_in_memory() {
        let store = SqliteStore::from_config(&CryptoConfig::default()).unwrap();
        let mode: String = store
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode, "memory");
    }

    #[test]
    fn wrapped_fixture_is_deterministic() {
        use crate::payload::Payload;
        use super::test_support::wrapped;

        assert_eq!(wrapped(4), wrapped(4));
        assert_eq!(wrapped(4).to_bytes(), wrapped(4).to_bytes());
        assert_ne!(wrapped(4), wrapped(5));
    }
}
