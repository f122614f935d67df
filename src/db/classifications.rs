//! Classification audit rows. The table is both the operator-facing
//! audit trail (with model/prompt pins for rollback) and the dedupe
//! window that makes `/classify` idempotent.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{DbError, Store};
use crate::types::Classification;

impl Store {
    pub fn insert_classification(
        &self,
        user_id: &str,
        classification: &Classification,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let id = format!("cls-{}", Uuid::new_v4());
            conn.execute(
                "INSERT INTO classifications
                    (id, user_id, message_id, decider, email_type, type_conf,
                     classification, model_version, prompt_version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    id,
                    user_id,
                    classification.message_id,
                    classification.decider.as_str(),
                    classification.email_type.as_str(),
                    classification.type_conf,
                    serde_json::to_string(classification)?,
                    classification.model_version,
                    classification.prompt_version,
                    now.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent classification of this message inside the dedupe
    /// window, if any.
    pub fn recent_classification(
        &self,
        user_id: &str,
        message_id: &str,
        window_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Classification>, DbError> {
        let cutoff = (now - Duration::hours(window_hours)).to_rfc3339();
        self.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT classification FROM classifications
                     WHERE user_id = ?1 AND message_id = ?2 AND created_at >= ?3
                     ORDER BY created_at DESC
                     LIMIT 1",
                    params![user_id, message_id, cutoff],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    pub fn classification_count(&self, user_id: &str) -> Result<i64, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM classifications WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(DbError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_store;
    use chrono::TimeZone;

    fn classification(message_id: &str) -> Classification {
        use crate::types::*;
        Classification {
            message_id: message_id.to_string(),
            email_type: EmailType::Receipt,
            type_conf: 0.9,
            domains: vec![],
            domain_conf: Default::default(),
            attention: Attention::None,
            attention_conf: 0.2,
            importance: Importance::Routine,
            importance_conf: 0.7,
            relationship: Relationship::FromUnknown,
            client_label: ClientLabel::Receipts,
            decider: Decider::Llm,
            reason: "test".to_string(),
            model_version: "m".to_string(),
            prompt_version: "p".to_string(),
        }
    }

    #[test]
    fn test_recent_classification_within_window() {
        let store = test_store();
        let now = Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap();
        store
            .insert_classification("u1", &classification("m1"), now)
            .expect("insert");

        let hit = store
            .recent_classification("u1", "m1", 24, now + chrono::Duration::hours(1))
            .expect("query");
        assert!(hit.is_some());

        let miss = store
            .recent_classification("u1", "m1", 24, now + chrono::Duration::hours(30))
            .expect("query");
        assert!(miss.is_none(), "outside the window the audit row is not reused");
    }

    #[test]
    fn test_recent_classification_is_tenancy_scoped() {
        let store = test_store();
        let now = Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap();
        store
            .insert_classification("u1", &classification("m1"), now)
            .expect("insert");

        let other = store
            .recent_classification("u2", "m1", 24, now)
            .expect("query");
        assert!(other.is_none());
    }
}
