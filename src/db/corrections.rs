//! Corrections (append-only) and the feedback audit table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{DbError, Store};
use crate::types::Classification;

impl Store {
    /// Append one correction row. Corrections are never updated or
    /// deleted.
    pub fn insert_correction(
        &self,
        conn: &Connection,
        user_id: &str,
        message_id: &str,
        from_addr: &str,
        subject: &str,
        original: &Classification,
        corrected: &Classification,
        now: DateTime<Utc>,
    ) -> Result<String, DbError> {
        let id = format!("corr-{}", Uuid::new_v4());
        let ts = now.to_rfc3339();
        conn.execute(
            "INSERT INTO corrections
                (id, user_id, message_id, from_addr, subject, original, corrected,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                user_id,
                message_id,
                from_addr,
                subject,
                serde_json::to_string(original)?,
                serde_json::to_string(corrected)?,
                ts
            ],
        )?;
        Ok(id)
    }

    pub fn correction_count(&self, user_id: &str) -> Result<i64, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM corrections WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(DbError::from)
        })
    }

    /// Record a verifier outcome or a user confirmation.
    pub fn insert_feedback(
        &self,
        user_id: &str,
        message_id: &str,
        kind: &str,
        detail: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let id = format!("fb-{}", Uuid::new_v4());
            conn.execute(
                "INSERT INTO feedback
                    (id, user_id, message_id, kind, detail, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, user_id, message_id, kind, detail.to_string(), now.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn feedback_count(&self, user_id: &str, kind: &str) -> Result<i64, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM feedback WHERE user_id = ?1 AND kind = ?2",
                params![user_id, kind],
                |row| row.get(0),
            )
            .map_err(DbError::from)
        })
    }
}
