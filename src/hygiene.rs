//! Prompt hygiene: everything that leaves for a language model or a log
//! line passes through here first.
//!
//! Three jobs:
//! 1. Truncate fields to the caller's length budget (char-safe).
//! 2. Scrub known prompt-injection patterns and markup delimiters.
//! 3. Hash PII for structured logs — no raw subject, from-address, or
//!    snippet ever appears at info level.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::types::EmailEnvelope;

/// Marker substituted for scrubbed injection attempts.
const REDACTION_MARKER: &str = "[redacted]";

/// Length budgets for the classification prompt.
pub const MAX_SUBJECT_LEN: usize = 300;
pub const MAX_FROM_LEN: usize = 120;
pub const MAX_SNIPPET_LEN: usize = 1200;

fn injection_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // "ignore previous/prior/above instructions" family
            r"(?i)\bignore\s+(?:all\s+)?(?:previous|prior|above|earlier)\s+(?:instructions|prompts|messages)\b",
            r"(?i)\bdisregard\s+(?:all\s+)?(?:previous|prior|above|earlier)\b",
            r"(?i)\bforget\s+(?:all\s+)?(?:previous|prior|your)\s+instructions\b",
            // Role impersonation
            r"(?i)^\s*(?:system|assistant)\s*:",
            r"(?i)\byou\s+are\s+now\s+(?:a|an|the)\b",
            r"(?i)\bnew\s+(?:system\s+)?instructions?\s*:",
            // Triple-backtick role blocks
            r"(?is)```\s*(?:system|assistant|user)\b.*?```",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("injection pattern must compile"))
        .collect()
    })
}

/// Sanitize one text field for inclusion in a prompt.
pub fn sanitize(text: &str, max_len: usize) -> String {
    // Injection patterns run against the raw text; some of them key on
    // the very delimiters the second pass removes.
    let mut scrubbed = text.to_string();
    for pattern in injection_patterns() {
        scrubbed = pattern.replace_all(&scrubbed, REDACTION_MARKER).into_owned();
    }

    // Control chars and markup delimiters become spaces so words stay
    // separated.
    let mut out = String::with_capacity(scrubbed.len());
    for c in scrubbed.chars() {
        if c.is_control() || matches!(c, '<' | '>' | '{' | '}' | '|' | '`') {
            out.push(' ');
            continue;
        }
        out.push(c);
    }

    truncate_chars(&out, max_len)
}

/// Char-safe truncation (never splits a multi-byte character).
pub fn truncate_chars(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    text.chars().take(max_len).collect()
}

/// Stable 12-hex prefix of SHA-256. Used wherever a PII field must be
/// correlated in logs without being readable.
pub fn hash_pii(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

/// A message with every prompt-bound field sanitized. The classifier and
/// verifier only ever hand this shape to the LLM adapter.
#[derive(Debug, Clone)]
pub struct SanitizedEmail {
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub snippet: String,
}

pub fn sanitize_email(envelope: &EmailEnvelope) -> SanitizedEmail {
    SanitizedEmail {
        message_id: envelope.id.clone(),
        from: sanitize(&envelope.from, MAX_FROM_LEN),
        subject: sanitize(&envelope.subject, MAX_SUBJECT_LEN),
        snippet: sanitize(&envelope.snippet, MAX_SNIPPET_LEN),
    }
}
