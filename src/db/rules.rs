//! Per-user learned rules: CRUD, matching, and explicit usage tracking.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::types::{ClassificationTemplate, DbRule, PatternType};
use super::{DbError, Store};
use crate::classify::type_mapper::{extract_domain, extract_email_address};

fn map_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(DbRule, String)> {
    let template_json: String = row.get(4)?;
    Ok((
        DbRule {
            id: row.get(0)?,
            user_id: row.get(1)?,
            pattern_type: PatternType::parse(&row.get::<_, String>(2)?)
                .unwrap_or(PatternType::SubjectContains),
            pattern: row.get(3)?,
            template: ClassificationTemplate {
                // replaced below once the JSON is parsed
                email_type: crate::types::EmailType::Uncategorized,
                type_conf: 0.0,
                domains: Vec::new(),
                domain_conf: Default::default(),
                attention: crate::types::Attention::None,
                attention_conf: 0.0,
                importance: crate::types::Importance::Routine,
                importance_conf: 0.0,
            },
            confidence: row.get(5)?,
            use_count: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        },
        template_json,
    ))
}

fn finish_rule((mut rule, template_json): (DbRule, String)) -> Result<DbRule, DbError> {
    rule.template = serde_json::from_str(&template_json)?;
    Ok(rule)
}

impl Store {
    /// Insert a rule unless one with the same `(user, pattern_type,
    /// pattern, template.type)` key already exists. Returns the id of the
    /// rule that holds the key afterwards.
    pub fn insert_rule(
        &self,
        conn: &Connection,
        user_id: &str,
        pattern_type: PatternType,
        pattern: &str,
        template: &ClassificationTemplate,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<String, DbError> {
        let id = format!("rule-{}", Uuid::new_v4());
        let template_json = serde_json::to_string(template)?;
        let ts = now.to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO rules
                (id, user_id, pattern_type, pattern, template_type, template,
                 confidence, use_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
            params![
                id,
                user_id,
                pattern_type.as_str(),
                pattern,
                template.email_type.as_str(),
                template_json,
                confidence,
                ts
            ],
        )?;

        let existing: String = conn.query_row(
            "SELECT id FROM rules
             WHERE user_id = ?1 AND pattern_type = ?2 AND pattern = ?3 AND template_type = ?4",
            params![user_id, pattern_type.as_str(), pattern, template.email_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(existing)
    }

    /// List a user's rules, most recently used first.
    pub fn list_rules(&self, user_id: &str) -> Result<Vec<DbRule>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, pattern_type, pattern, template, confidence,
                        use_count, created_at, updated_at
                 FROM rules
                 WHERE user_id = ?1
                 ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map(params![user_id], map_rule_row)?;
            let mut rules = Vec::new();
            for row in rows {
                rules.push(finish_rule(row?)?);
            }
            Ok(rules)
        })
    }

    /// True when the user already has a rule of strictly higher pattern
    /// precedence, covering the same senders, whose template type
    /// differs. Used to veto promotions that would conflict with what
    /// the user already taught us: a domain candidate loses to an
    /// exact-sender rule inside that domain.
    pub fn has_conflicting_higher_precedence_rule(
        &self,
        conn: &Connection,
        user_id: &str,
        pattern_type: PatternType,
        pattern: &str,
        email_type: &str,
    ) -> Result<bool, DbError> {
        let count: i64 = match pattern_type {
            // Nothing outranks an exact sender.
            PatternType::ExactSender => 0,
            PatternType::SenderDomain => conn.query_row(
                "SELECT COUNT(*) FROM rules
                 WHERE user_id = ?1
                   AND template_type != ?2
                   AND pattern_type = 'exact_sender'
                   AND pattern LIKE '%@' || ?3",
                params![user_id, email_type, pattern],
                |row| row.get(0),
            )?,
            // Subject rules rank below both sender kinds.
            PatternType::SubjectContains => conn.query_row(
                "SELECT COUNT(*) FROM rules
                 WHERE user_id = ?1
                   AND template_type != ?2
                   AND pattern_type IN ('exact_sender', 'sender_domain')",
                params![user_id, email_type],
                |row| row.get(0),
            )?,
        };
        Ok(count > 0)
    }

    /// Park a candidate whose promotion was vetoed, for operator review.
    pub fn insert_pending_rule(
        &self,
        conn: &Connection,
        user_id: &str,
        pattern_type: PatternType,
        pattern: &str,
        template: &ClassificationTemplate,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let id = format!("pend-{}", Uuid::new_v4());
        conn.execute(
            "INSERT OR IGNORE INTO pending_rules
                (id, user_id, pattern_type, pattern, template_type, template,
                 confidence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                user_id,
                pattern_type.as_str(),
                pattern,
                template.email_type.as_str(),
                serde_json::to_string(template)?,
                confidence,
                now.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn pending_rule_count(&self, user_id: &str) -> Result<i64, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM pending_rules WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(DbError::from)
        })
    }

    /// Find the best rule for this message and increment its `use_count`.
    ///
    /// The name is explicit because this method WRITES: the usage
    /// increment commits before the classification is returned. Ties
    /// break by `(pattern precedence, use_count desc, recency desc)`.
    pub fn match_and_track_usage(
        &self,
        user_id: &str,
        from: &str,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DbRule>, DbError> {
        let from_addr = extract_email_address(from);
        let domain = extract_domain(&from_addr);
        let subject_lower = subject.to_lowercase();

        self.with_transaction(|conn| {
            let matched = conn
                .query_row(
                    "SELECT id, user_id, pattern_type, pattern, template, confidence,
                            use_count, created_at, updated_at
                     FROM rules
                     WHERE user_id = ?1
                       AND (
                            (pattern_type = 'exact_sender' AND pattern = ?2)
                         OR (pattern_type = 'sender_domain' AND pattern = ?3)
                         OR (pattern_type = 'subject_contains' AND instr(?4, pattern) > 0)
                       )
                     ORDER BY CASE pattern_type
                                WHEN 'exact_sender' THEN 0
                                WHEN 'sender_domain' THEN 1
                                ELSE 2
                              END,
                              use_count DESC,
                              updated_at DESC
                     LIMIT 1",
                    params![user_id, from_addr, domain, subject_lower],
                    map_rule_row,
                )
                .optional()?;

            let Some(raw) = matched else { return Ok(None) };
            let mut rule = finish_rule(raw)?;

            conn.execute(
                "UPDATE rules SET use_count = use_count + 1, updated_at = ?2 WHERE id = ?1",
                params![rule.id, now.to_rfc3339()],
            )?;
            rule.use_count += 1;
            Ok(Some(rule))
        })
    }
}
