//! Learned pattern candidates: support counting ahead of promotion.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::types::{ClassificationTemplate, PatternType};
use super::{DbError, Store};

impl Store {
    /// Upsert a candidate pattern, incrementing `support_count` on
    /// conflict. Returns the support count after the write.
    pub fn upsert_learned_pattern(
        &self,
        conn: &Connection,
        user_id: &str,
        pattern_type: PatternType,
        pattern: &str,
        template: &ClassificationTemplate,
        now: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let id = format!("lp-{}", Uuid::new_v4());
        let ts = now.to_rfc3339();
        let template_json = serde_json::to_string(template)?;
        conn.execute(
            "INSERT INTO learned_patterns
                (id, user_id, pattern_type, pattern, template_type, template,
                 support_count, first_seen, last_seen, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7, ?7)
             ON CONFLICT (user_id, pattern_type, pattern, template_type) DO UPDATE SET
                support_count = support_count + 1,
                template = excluded.template,
                last_seen = excluded.last_seen,
                updated_at = excluded.updated_at",
            params![
                id,
                user_id,
                pattern_type.as_str(),
                pattern,
                template.email_type.as_str(),
                template_json,
                ts
            ],
        )?;

        let support: i64 = conn.query_row(
            "SELECT support_count FROM learned_patterns
             WHERE user_id = ?1 AND pattern_type = ?2 AND pattern = ?3 AND template_type = ?4",
            params![user_id, pattern_type.as_str(), pattern, template.email_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(support)
    }

    pub fn learned_pattern_count(&self, user_id: &str) -> Result<i64, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM learned_patterns WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(DbError::from)
        })
    }
}
