//! Second-pass verification of suspicious classifications.
//!
//! A stricter LLM call receives the primary classification and the
//! sanitized message, and answers confirm or reject. A reject only
//! stands when the correction is more confident than the original by at
//! least `verifier_accept_delta`. Both outcomes land in the feedback
//! audit table.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Policy;
use crate::db::Store;
use crate::error::CoreError;
use crate::hygiene::SanitizedEmail;
use crate::llm::adapter::LlmAdapter;
use crate::llm::schema::VerdictKind;
use crate::types::{Classification, Decider};

pub struct VerifierOutcome {
    pub classification: Classification,
    pub overturned: bool,
}

pub async fn reconsider(
    adapter: &Arc<LlmAdapter>,
    store: &Arc<Store>,
    policy: &Policy,
    user_id: &str,
    email: &SanitizedEmail,
    original: Classification,
    now: DateTime<Utc>,
) -> Result<VerifierOutcome, CoreError> {
    let (verdict, telemetry) = adapter.verify_classification(email, &original, now).await?;
    store.insert_cost_event(user_id, &telemetry, now)?;

    match (verdict.verdict, verdict.correction) {
        (VerdictKind::Confirm, _) => {
            store.insert_feedback(
                user_id,
                &email.message_id,
                "verifier_confirm",
                &serde_json::json!({
                    "type": original.email_type.as_str(),
                    "type_conf": original.type_conf,
                    "verifier_confidence": verdict.confidence,
                }),
                now,
            )?;
            Ok(VerifierOutcome { classification: original, overturned: false })
        }
        (VerdictKind::Reject, Some(mut correction)) => {
            let delta = correction.type_conf - original.type_conf;
            let accepted = delta >= policy.verifier_accept_delta;
            store.insert_feedback(
                user_id,
                &email.message_id,
                "verifier_reject",
                &serde_json::json!({
                    "original_type": original.email_type.as_str(),
                    "original_conf": original.type_conf,
                    "corrected_type": correction.email_type.as_str(),
                    "corrected_conf": correction.type_conf,
                    "delta": delta,
                    "accepted": accepted,
                }),
                now,
            )?;
            if accepted {
                correction.decider = Decider::Verifier;
                Ok(VerifierOutcome { classification: correction, overturned: true })
            } else {
                // Not confident enough to overturn: the original stands.
                Ok(VerifierOutcome { classification: original, overturned: false })
            }
        }
        // parse_verdict guarantees reject carries a correction.
        (VerdictKind::Reject, None) => Err(CoreError::LlmSchemaInvalid(
            "reject verdict without correction".to_string(),
        )),
    }
}
