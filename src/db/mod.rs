//! SQLite-backed store for rules, corrections, learned patterns, audit
//! rows, digest sessions, and cost events.
//!
//! One logical store, one schema. WAL journal mode so readers stay
//! concurrent with the single writer. Writes use short transactions via
//! `with_transaction`; long-running work never holds a connection lock.

use std::path::PathBuf;

use parking_lot::Mutex;
use rusqlite::Connection;
use thiserror::Error;

pub mod classifications;
pub mod corrections;
pub mod cost_events;
pub mod patterns;
pub mod rules;
pub mod sessions;
pub mod types;

pub use types::*;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create data directory: {0}")]
    CreateDir(std::io::Error),

    #[error("could not determine home directory")]
    HomeDirNotFound,

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `~/.inboxos/inboxos.db` (or
    /// `INBOXOS_DB` when set) and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL: concurrent readers while one writer holds the journal.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn db_path() -> Result<PathBuf, DbError> {
        if let Ok(path) = std::env::var("INBOXOS_DB") {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".inboxos").join("inboxos.db"))
    }

    /// Run a closure against the connection. Keep closures short: the
    /// lock serializes writers.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a closure within a transaction. Commits on Ok, rolls back
    /// on Err.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(val) => {
                conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::test_store;
    use super::*;

    #[test]
    fn test_open_applies_schema() {
        let store = test_store();
        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))
                    .map_err(DbError::from)
            })
            .expect("query");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = test_store();
        let result: Result<(), DbError> = store.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO feedback (id, user_id, message_id, kind, detail, created_at, updated_at)
                 VALUES ('f1', 'u1', 'm1', 'user_confirm', '{}', datetime('now'), datetime('now'))",
                [],
            )?;
            Err(DbError::Migration("forced".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get(0))
                    .map_err(DbError::from)
            })
            .expect("query");
        assert_eq!(count, 0, "rollback must discard the insert");
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let store = test_store();
        store
            .with_transaction(|conn| {
                conn.execute(
                    "INSERT INTO feedback (id, user_id, message_id, kind, detail, created_at, updated_at)
                     VALUES ('f1', 'u1', 'm1', 'user_confirm', '{}', datetime('now'), datetime('now'))",
                    [],
                )?;
                Ok(())
            })
            .expect("txn");

        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get(0))
                    .map_err(DbError::from)
            })
            .expect("query");
        assert_eq!(count, 1);
    }
}
