//! Digest session audit rows.
//!
//! A session row is inserted as `running` when the pipeline starts and
//! finalized exactly once on completion. Finalized rows are immutable.
//! Rows left behind by crashed or cancelled runs are reaped at the next
//! startup.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::DbSession;
use super::{DbError, Store};

impl Store {
    pub fn insert_session_running(
        &self,
        user_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
        timezone: &str,
        input_message_ids: &[String],
    ) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions
                    (session_id, user_id, status, now_utc, timezone, input_message_ids,
                     created_at, updated_at)
                 VALUES (?1, ?2, 'running', ?3, ?4, ?5, ?6, ?6)",
                params![
                    session_id,
                    user_id,
                    now.to_rfc3339(),
                    timezone,
                    serde_json::to_string(input_message_ids)?,
                    now.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// One-shot transition `running` → `complete`. A second finalize is a
    /// no-op, keeping completed rows immutable.
    pub fn finalize_session(
        &self,
        user_id: &str,
        session_id: &str,
        output_html_sha256: &str,
        stage_timings: &serde_json::Value,
        decider_counts: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET
                    status = 'complete',
                    output_html_sha256 = ?3,
                    stage_timings = ?4,
                    decider_counts = ?5,
                    updated_at = ?6
                 WHERE user_id = ?1 AND session_id = ?2 AND status = 'running'",
                params![
                    user_id,
                    session_id,
                    output_html_sha256,
                    stage_timings.to_string(),
                    decider_counts.to_string(),
                    now.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, user_id: &str, session_id: &str) -> Result<Option<DbSession>, DbError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT session_id, user_id, status, now_utc, timezone,
                            input_message_ids, output_html_sha256, stage_timings, decider_counts
                     FROM sessions
                     WHERE user_id = ?1 AND session_id = ?2",
                    params![user_id, session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                            row.get::<_, Option<String>>(8)?,
                        ))
                    },
                )
                .optional()?;

            let Some((session_id, user_id, status, now_utc, timezone, ids, hash, timings, counts)) =
                row
            else {
                return Ok(None);
            };
            Ok(Some(DbSession {
                session_id,
                user_id,
                status,
                now_utc,
                timezone,
                input_message_ids: serde_json::from_str(&ids)?,
                output_html_sha256: hash,
                stage_timings: timings.map(|t| serde_json::from_str(&t)).transpose()?,
                decider_counts: counts.map(|c| serde_json::from_str(&c)).transpose()?,
            }))
        })
    }

    /// Delete sessions that never completed. Called once at startup.
    pub fn reap_incomplete_sessions(&self) -> Result<usize, DbError> {
        self.with_conn(|conn| {
            let reaped = conn.execute("DELETE FROM sessions WHERE status != 'complete'", [])?;
            Ok(reaped)
        })
    }
}
