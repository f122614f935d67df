//! Correction recording and rule promotion.
//!
//! The whole loop is one linear pipeline exposed as `record_and_learn`.
//! Every write it performs is listed here, in order, and all of them
//! happen inside a single storage transaction:
//!
//! 1. `corrections` — one append-only row for the user correction.
//! 2. `learned_patterns` — support-count increments for the derived
//!    candidates `(exact_sender, from)` and `(sender_domain, domain)`.
//! 3. `rules` — at most one insert per candidate whose support reached
//!    the promotion threshold and that conflicts with no
//!    higher-precedence rule.
//!
//! There are no other writes. Classification-time learning
//! (`record_candidate`) reuses steps 2 and 3 for confirmations the
//! orchestrator marks learn-eligible.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::classify::type_mapper::{extract_domain, extract_email_address};
use crate::db::{ClassificationTemplate, DbError, PatternType, Store};
use crate::error::CoreError;
use crate::types::Classification;

/// Candidates promote once the same pattern has been seen this many times.
pub const PROMOTION_SUPPORT: i64 = 2;

/// Promoted-rule confidence: grows with support, capped below certainty.
pub fn promotion_confidence(support_count: i64) -> f64 {
    (0.70 + 0.05 * support_count as f64).min(0.95)
}

#[derive(Debug, Clone)]
pub struct LearnOutcome {
    pub correction_id: String,
    pub promoted_rule_id: Option<String>,
}

/// Record a user correction and run the full learning pipeline in one
/// transaction. Concurrent identical corrections converge on the same
/// rule (unique pattern key; the insert is idempotent).
pub fn record_and_learn(
    store: &Store,
    user_id: &str,
    message_id: &str,
    from: &str,
    subject: &str,
    original: &Classification,
    corrected: &Classification,
    now: DateTime<Utc>,
) -> Result<LearnOutcome, CoreError> {
    corrected.validate()?;
    let template = ClassificationTemplate::from_classification(corrected);

    let outcome = store.with_transaction(|conn| {
        let correction_id = store.insert_correction(
            conn, user_id, message_id, from, subject, original, corrected, now,
        )?;
        let promoted_rule_id =
            derive_count_and_promote(store, conn, user_id, from, &template, now)?;
        Ok(LearnOutcome { correction_id, promoted_rule_id })
    })?;

    tracing::info!(
        user = %crate::hygiene::hash_pii(user_id),
        sender = %crate::hygiene::hash_pii(from),
        promoted = outcome.promoted_rule_id.is_some(),
        "correction recorded"
    );
    Ok(outcome)
}

/// Classification-time candidate write for learn-eligible results.
/// Same derivation and promotion as a correction, without a
/// `corrections` row.
pub fn record_candidate(
    store: &Store,
    user_id: &str,
    from: &str,
    classification: &Classification,
    now: DateTime<Utc>,
) -> Result<Option<String>, CoreError> {
    let template = ClassificationTemplate::from_classification(classification);
    let promoted = store.with_transaction(|conn| {
        derive_count_and_promote(store, conn, user_id, from, &template, now)
    })?;
    Ok(promoted)
}

/// For a correction on `from = X`, the candidates are `(exact_sender, X)`
/// and `(sender_domain, domainOf(X))`, counted and promoted
/// independently. Precedence at match time keeps the exact rule winning.
fn derive_count_and_promote(
    store: &Store,
    conn: &Connection,
    user_id: &str,
    from: &str,
    template: &ClassificationTemplate,
    now: DateTime<Utc>,
) -> Result<Option<String>, DbError> {
    let from_addr = extract_email_address(from);
    let domain = extract_domain(&from_addr);

    let mut candidates = vec![(PatternType::ExactSender, from_addr)];
    if !domain.is_empty() {
        candidates.push((PatternType::SenderDomain, domain));
    }

    let mut promoted_rule_id = None;
    for (pattern_type, pattern) in candidates {
        let support =
            store.upsert_learned_pattern(conn, user_id, pattern_type, &pattern, template, now)?;
        if support < PROMOTION_SUPPORT {
            continue;
        }
        if store.has_conflicting_higher_precedence_rule(
            conn,
            user_id,
            pattern_type,
            &pattern,
            template.email_type.as_str(),
        )? {
            // Vetoed, not discarded: an operator can still promote it.
            store.insert_pending_rule(
                conn,
                user_id,
                pattern_type,
                &pattern,
                template,
                promotion_confidence(support),
                now,
            )?;
            tracing::debug!(
                pattern_type = pattern_type.as_str(),
                "promotion parked: conflicting higher-precedence rule"
            );
            continue;
        }
        let rule_id = store.insert_rule(
            conn,
            user_id,
            pattern_type,
            &pattern,
            template,
            promotion_confidence(support),
            now,
        )?;
        // The exact-sender rule is the one reported when both promote.
        if promoted_rule_id.is_none() {
            promoted_rule_id = Some(rule_id);
        }
    }
    Ok(promoted_rule_id)
}
