//! Entity extraction: rule-first, LLM-second.
//!
//! Regex families structure the common shapes (flight numbers, tracking
//! numbers, deadlines). Messages in the urgent sections that rules could
//! not structure may go to the LLM when the `llm_entities` feature is
//! on; the digest never requires it. Duplicates within
//! `(source_message_id, variant, natural_key)` are dropped, earliest
//! wins.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::{
    ClassifiedEmail, EmailType, Entity, EntityCore, EntityKind, Importance, Section,
    TemporalContext,
};

fn flight_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bflight\s+([A-Z]{2})\s?(\d{2,4})\b").expect("flight pattern")
    })
}

fn tracking_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:\btracking\s+(?:number|#|no\.?)?:?\s*([A-Z0-9]{10,22})\b|\b(1Z[0-9A-Z]{16})\b)")
            .expect("tracking pattern")
    })
}

fn deadline_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:due|deadline|submit|respond)\s+(?:by|on|before)\b")
            .expect("deadline pattern")
    })
}

/// Rule-first extraction for one message. The classification and the
/// intrinsic temporal context steer which variants apply.
pub fn extract_rule_entities(email: &ClassifiedEmail, temporal: &TemporalContext) -> Vec<Entity> {
    let subject = email.email.subject.as_str();
    let snippet = email.email.snippet.as_str();
    let text = format!("{} {}", subject, snippet);
    let classification = &email.classification;

    let core = |event_time| EntityCore {
        source_message_id: email.email.id.clone(),
        source_subject: subject.to_string(),
        importance: classification.importance,
        event_time,
    };

    let mut out = Vec::new();

    if let Some(caps) = flight_re().captures(&text) {
        let airline = caps.get(1).map(|m| m.as_str().to_uppercase());
        let number = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        out.push(Entity {
            core: core(temporal.event_start),
            kind: EntityKind::Flight {
                flight_number: format!("{}{}", airline.clone().unwrap_or_default(), number),
                airline,
            },
        });
    }

    if let Some(caps) = tracking_re().captures(&text) {
        let tracking = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_uppercase())
            .unwrap_or_default();
        if !tracking.is_empty() {
            out.push(Entity {
                core: core(temporal.delivery_date),
                kind: EntityKind::Delivery { tracking_number: tracking, carrier: None },
            });
        }
    }

    if deadline_re().is_match(&text) {
        let when = temporal.event_start.or(temporal.expiration_date);
        out.push(Entity {
            core: core(when),
            kind: EntityKind::Deadline { what: subject.to_string() },
        });
    }

    match classification.email_type {
        EmailType::Event => {
            out.push(Entity {
                core: core(temporal.event_start),
                kind: EntityKind::Event { title: subject.to_string() },
            });
        }
        EmailType::Promotion => {
            out.push(Entity::promo(
                email.email.id.clone(),
                subject.to_string(),
                subject.to_string(),
            ));
        }
        EmailType::Notification if out.is_empty() => {
            out.push(Entity {
                core: core(None),
                kind: EntityKind::Notification { summary: subject.to_string() },
            });
        }
        _ => {}
    }

    // A message with only an expiration date and nothing else structured
    // is worth a reminder.
    if out.is_empty() && temporal.expiration_date.is_some() {
        out.push(Entity {
            core: core(temporal.expiration_date),
            kind: EntityKind::Reminder { what: subject.to_string() },
        });
    }

    // A plain event time with no classified shape still surfaces.
    if out.is_empty() && temporal.event_start.is_some() {
        out.push(Entity {
            core: core(temporal.event_start),
            kind: EntityKind::Event { title: subject.to_string() },
        });
    }

    out
}

/// Drop later duplicates of `(source_message_id, variant, natural_key)`.
pub fn dedupe(entities: Vec<Entity>) -> Vec<Entity> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(entities.len());
    for entity in entities {
        let key = (
            entity.core.source_message_id.clone(),
            entity.variant_name(),
            entity.natural_key(),
        );
        if seen.insert(key) {
            out.push(entity);
        }
    }
    out
}

/// Sections whose unstructured messages justify an LLM pass.
pub fn wants_llm_pass(section: Section) -> bool {
    matches!(section, Section::Critical | Section::Today | Section::ComingUp)
}
