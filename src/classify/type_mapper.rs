//! Deterministic type mapping (tier 0 of the classifier).
//!
//! Global, user-independent pattern tables produce a `type` override with
//! high confidence. Matching order is stable: OTP detector → domain exact
//! → sender pattern → subject → body → attachment. First match wins.

use std::sync::OnceLock;

use regex::Regex;

use super::constants::{
    ATTACHMENT_RECEIPT_KEYWORDS, BODY_PHRASE_TYPES, OTP_PATTERNS, SENDER_DOMAIN_TYPES,
    SENDER_LOCAL_TYPES, SUBJECT_PATTERN_TYPES,
};
use crate::types::{Decider, EmailEnvelope, EmailType, Importance};

/// Confidence carried by table matches.
const TABLE_CONF: f64 = 0.98;
/// The OTP detector is even more certain: the pattern family is narrow.
const OTP_CONF: f64 = 0.99;

/// A deterministic match, before it is expanded into a full
/// classification by the orchestrator.
#[derive(Debug, Clone)]
pub struct TypeMatch {
    pub email_type: EmailType,
    pub confidence: f64,
    pub decider: Decider,
    pub importance: Importance,
    pub reason: String,
}

fn otp_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        OTP_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("otp pattern must compile"))
            .collect()
    })
}

fn subject_regexes() -> &'static Vec<(Regex, EmailType)> {
    static REGEXES: OnceLock<Vec<(Regex, EmailType)>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        SUBJECT_PATTERN_TYPES
            .iter()
            .map(|(p, t)| (Regex::new(p).expect("subject pattern must compile"), *t))
            .collect()
    })
}

/// Extract bare email from a "From" header like "Name <email@example.com>".
pub fn extract_email_address(from_field: &str) -> String {
    if let Some(start) = from_field.find('<') {
        if let Some(end) = from_field.find('>') {
            if end > start {
                return from_field[start + 1..end].to_lowercase();
            }
        }
    }
    from_field.trim().to_lowercase()
}

/// Extract domain from an email address.
pub fn extract_domain(email_addr: &str) -> String {
    match email_addr.rfind('@') {
        Some(at_pos) => email_addr[at_pos + 1..].to_lowercase(),
        None => String::new(),
    }
}

fn has_attachment(envelope: &EmailEnvelope) -> bool {
    envelope
        .headers
        .as_ref()
        .map(|h| {
            h.keys().any(|k| k.eq_ignore_ascii_case("x-attachment-count"))
                || h.get("content-type")
                    .map(|v| v.to_lowercase().contains("multipart/mixed"))
                    .unwrap_or(false)
        })
        .unwrap_or(false)
}

/// Match one message against the compiled tables. `None` means the next
/// tier (learned rules, then the LLM) decides.
pub fn match_email(envelope: &EmailEnvelope) -> Option<TypeMatch> {
    let from_addr = extract_email_address(&envelope.from);
    let domain = extract_domain(&from_addr);
    let subject = envelope.subject.as_str();
    let snippet = envelope.snippet.as_str();

    // OTP detector first: short-lived, security-relevant, must never be
    // mislabelled by a broader table row.
    for pattern in otp_regexes() {
        if pattern.is_match(subject) || pattern.is_match(snippet) {
            return Some(TypeMatch {
                email_type: EmailType::Otp,
                confidence: OTP_CONF,
                decider: Decider::Detector,
                importance: Importance::Critical,
                reason: "one-time code detected".to_string(),
            });
        }
    }

    // Domain exact
    for (table_domain, email_type) in SENDER_DOMAIN_TYPES {
        if domain == *table_domain {
            return Some(table_match(*email_type, format!("sender domain {}", table_domain)));
        }
    }

    // Sender local-part pattern
    if let Some(at_pos) = from_addr.find('@') {
        let local = &from_addr[..at_pos];
        for (pattern, email_type) in SENDER_LOCAL_TYPES {
            if local.contains(pattern) {
                return Some(table_match(*email_type, format!("sender pattern {}", pattern)));
            }
        }
    }

    // Subject
    for (pattern, email_type) in subject_regexes() {
        if pattern.is_match(subject) {
            return Some(table_match(*email_type, "subject pattern".to_string()));
        }
    }

    // Body phrase
    let snippet_lower = snippet.to_lowercase();
    for (phrase, email_type) in BODY_PHRASE_TYPES {
        if snippet_lower.contains(phrase) {
            return Some(table_match(*email_type, format!("body phrase {:?}", phrase)));
        }
    }

    // Attachment presence
    if has_attachment(envelope) {
        let subject_lower = subject.to_lowercase();
        if ATTACHMENT_RECEIPT_KEYWORDS.iter().any(|kw| subject_lower.contains(kw)) {
            return Some(table_match(EmailType::Receipt, "document attachment".to_string()));
        }
    }

    None
}

fn table_match(email_type: EmailType, reason: String) -> TypeMatch {
    let importance = match email_type {
        EmailType::Event => Importance::TimeSensitive,
        _ => Importance::Routine,
    };
    TypeMatch {
        email_type,
        confidence: TABLE_CONF,
        decider: Decider::TypeMapper,
        importance,
        reason,
    }
}
