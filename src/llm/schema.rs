//! Structured-output contracts and strict validation.
//!
//! The provider is asked for a named schema; we still validate everything
//! it returns. Confidences outside [0,1] reject the output. Enum-valued
//! fields outside the known set collapse to a safe fallback and increment
//! a process-wide counter so quality regressions are visible in metrics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::CoreError;
use crate::types::{
    Attention, Classification, Domain, EmailType, Entity, EntityCore, EntityKind, Importance,
    Relationship,
};

pub const CLASSIFY_SCHEMA: &str = "email_classification_v1";
pub const VERIFY_SCHEMA: &str = "classification_verdict_v1";
pub const ENTITY_SCHEMA: &str = "digest_entities_v1";

/// Reason strings longer than this are truncated, not rejected.
const MAX_REASON_LEN: usize = 200;

static ENUM_COLLAPSES: AtomicU64 = AtomicU64::new(0);

fn note_collapse(field: &str, value: &str) {
    ENUM_COLLAPSES.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(field, value = %crate::hygiene::hash_pii(value), "collapsed unknown enum value");
}

/// Total unknown-enum collapses since process start.
pub fn enum_collapse_count() -> u64 {
    ENUM_COLLAPSES.load(Ordering::Relaxed)
}

fn require_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, CoreError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::LlmSchemaInvalid(format!("missing string field {}", field)))
}

fn require_conf(value: &Value, field: &str) -> Result<f64, CoreError> {
    let conf = value
        .get(field)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| CoreError::LlmSchemaInvalid(format!("missing numeric field {}", field)))?;
    if !(0.0..=1.0).contains(&conf) || conf.is_nan() {
        return Err(CoreError::LlmSchemaInvalid(format!(
            "{} out of range: {}",
            field, conf
        )));
    }
    Ok(conf)
}

/// Validate and convert one classification payload.
pub fn parse_classification(
    value: &Value,
    message_id: &str,
    relationship: Relationship,
    model_version: &str,
    prompt_version: &str,
) -> Result<Classification, CoreError> {
    let type_str = require_str(value, "type")?;
    let email_type = EmailType::parse(type_str).unwrap_or_else(|| {
        note_collapse("type", type_str);
        EmailType::Uncategorized
    });
    let type_conf = require_conf(value, "type_conf")?;

    // Domains arrive as a map of domain → confidence. Unknown domains are
    // dropped (whitelist), bad confidences reject the whole output.
    let mut domains = Vec::new();
    let mut domain_conf = BTreeMap::new();
    if let Some(map) = value.get("domains").and_then(|v| v.as_object()) {
        for (name, conf_value) in map {
            let conf = conf_value.as_f64().ok_or_else(|| {
                CoreError::LlmSchemaInvalid(format!("domain confidence for {} not numeric", name))
            })?;
            if !(0.0..=1.0).contains(&conf) || conf.is_nan() {
                return Err(CoreError::LlmSchemaInvalid(format!(
                    "domain confidence out of range: {}",
                    conf
                )));
            }
            match Domain::parse(name) {
                Some(domain) => {
                    domains.push(domain);
                    domain_conf.insert(domain, conf);
                }
                None => note_collapse("domain", name),
            }
        }
    }
    domains.sort();
    domains.dedup();

    let attention_str = require_str(value, "attention")?;
    let attention = match attention_str {
        "action_required" => Attention::ActionRequired,
        "none" => Attention::None,
        other => {
            note_collapse("attention", other);
            Attention::None
        }
    };
    let attention_conf = require_conf(value, "attention_conf")?;

    let importance_str = require_str(value, "importance")?;
    let importance = Importance::parse(importance_str).unwrap_or_else(|| {
        note_collapse("importance", importance_str);
        Importance::Routine
    });
    let importance_conf = require_conf(value, "importance_conf")?;

    let reason = value
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let reason = crate::hygiene::truncate_chars(&reason, MAX_REASON_LEN);

    let classification = Classification {
        message_id: message_id.to_string(),
        email_type,
        type_conf,
        domains,
        domain_conf,
        attention,
        attention_conf,
        importance,
        importance_conf,
        relationship,
        client_label: Classification::derive_client_label(email_type, attention),
        decider: crate::types::Decider::Llm,
        reason,
        model_version: model_version.to_string(),
        prompt_version: prompt_version.to_string(),
    };
    classification.validate()?;
    Ok(classification)
}

// ---------------------------------------------------------------------------
// Verifier verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    Confirm,
    Reject,
}

#[derive(Debug, Clone)]
pub struct VerifierVerdict {
    pub verdict: VerdictKind,
    pub correction: Option<Classification>,
    pub confidence: f64,
}

pub fn parse_verdict(
    value: &Value,
    message_id: &str,
    relationship: Relationship,
    model_version: &str,
    prompt_version: &str,
) -> Result<VerifierVerdict, CoreError> {
    let verdict_str = require_str(value, "verdict")?;
    let verdict = match verdict_str {
        "confirm" => VerdictKind::Confirm,
        "reject" => VerdictKind::Reject,
        other => {
            // An unknown verdict must not overturn the primary result.
            note_collapse("verdict", other);
            VerdictKind::Confirm
        }
    };
    let confidence = require_conf(value, "confidence")?;

    let correction = match (verdict, value.get("correction")) {
        (VerdictKind::Reject, Some(correction_value)) => Some(parse_classification(
            correction_value,
            message_id,
            relationship,
            model_version,
            prompt_version,
        )?),
        (VerdictKind::Reject, None) => {
            return Err(CoreError::LlmSchemaInvalid(
                "reject verdict without correction".to_string(),
            ))
        }
        _ => None,
    };

    Ok(VerifierVerdict { verdict, correction, confidence })
}

// ---------------------------------------------------------------------------
// Entity extraction
// ---------------------------------------------------------------------------

/// Lenient by design: individually malformed entities are skipped (and
/// counted), a malformed envelope rejects the output.
pub fn parse_entities(
    value: &Value,
    source_message_id: &str,
    source_subject: &str,
    importance: Importance,
) -> Result<Vec<Entity>, CoreError> {
    let items = value
        .get("entities")
        .and_then(|v| v.as_array())
        .ok_or_else(|| CoreError::LlmSchemaInvalid("missing entities array".to_string()))?;

    let mut out = Vec::new();
    for item in items {
        let kind_str = match item.get("kind").and_then(|v| v.as_str()) {
            Some(k) => k,
            None => {
                note_collapse("entity.kind", "<missing>");
                continue;
            }
        };
        let field = |name: &str| -> Option<String> {
            item.get(name).and_then(|v| v.as_str()).map(|s| {
                crate::hygiene::truncate_chars(s, 120)
            })
        };
        let event_time = item
            .get("event_time")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        let kind = match kind_str {
            "flight" => field("flight_number").map(|flight_number| EntityKind::Flight {
                flight_number,
                airline: field("airline"),
            }),
            "event" => field("title").map(|title| EntityKind::Event { title }),
            "deadline" => field("what").map(|what| EntityKind::Deadline { what }),
            "reminder" => field("what").map(|what| EntityKind::Reminder { what }),
            "delivery" => field("tracking_number").map(|tracking_number| EntityKind::Delivery {
                tracking_number,
                carrier: field("carrier"),
            }),
            "promo" => field("offer").map(|offer| EntityKind::Promo { offer }),
            "notification" => field("summary").map(|summary| EntityKind::Notification { summary }),
            other => {
                note_collapse("entity.kind", other);
                None
            }
        };

        if let Some(kind) = kind {
            // Promos stay routine regardless of what the model claims.
            let importance = if matches!(kind, EntityKind::Promo { .. }) {
                Importance::Routine
            } else {
                importance
            };
            out.push(Entity {
                core: EntityCore {
                    source_message_id: source_message_id.to_string(),
                    source_subject: source_subject.to_string(),
                    importance,
                    event_time,
                },
                kind,
            });
        }
    }
    Ok(out)
}
