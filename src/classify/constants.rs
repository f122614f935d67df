//! Compiled, user-independent tables for the deterministic type mapper.
//!
//! The quality bar is false positives: every row here must survive the
//! dataset tests in `type_mapper.rs` against near-miss negatives before
//! it ships.

use crate::types::EmailType;

/// Exact sender-domain overrides. First table consulted.
pub const SENDER_DOMAIN_TYPES: &[(&str, EmailType)] = &[
    ("github.com", EmailType::Notification),
    ("gitlab.com", EmailType::Notification),
    ("atlassian.net", EmailType::Notification),
    ("substack.com", EmailType::Newsletter),
    ("mailchimp.com", EmailType::Newsletter),
    ("sendgrid.net", EmailType::Newsletter),
    ("calendar-server.bounces.google.com", EmailType::Event),
    ("ups.com", EmailType::Notification),
    ("fedex.com", EmailType::Notification),
];

/// Sender local-part patterns (substring match on the part before `@`).
pub const SENDER_LOCAL_TYPES: &[(&str, EmailType)] = &[
    ("newsletter", EmailType::Newsletter),
    ("digest", EmailType::Newsletter),
    ("receipts", EmailType::Receipt),
    ("receipt", EmailType::Receipt),
    ("invoice", EmailType::Receipt),
    ("billing", EmailType::Receipt),
    ("promo", EmailType::Promotion),
    ("offers", EmailType::Promotion),
    ("marketing", EmailType::Promotion),
    ("calendar-notification", EmailType::Event),
    ("invite", EmailType::Event),
];

/// Subject regexes, checked in order after the sender tables. A bare
/// "Order #123" is NOT here: order numbers show up on receipts,
/// shipping notices, and promos alike, so that call stays with the
/// learned rules and the model.
pub const SUBJECT_PATTERN_TYPES: &[(&str, EmailType)] = &[
    (r"(?i)\b(?:your\s+)?order\s+confirmation\b", EmailType::Receipt),
    (r"(?i)\breceipt\s+(?:for|from)\b", EmailType::Receipt),
    (r"(?i)\binvoice\s+#?\d", EmailType::Receipt),
    (r"(?i)\bpayment\s+(?:received|confirmation)\b", EmailType::Receipt),
    (r"(?i)\bhas\s+(?:shipped|been\s+delivered)\b", EmailType::Notification),
    (r"(?i)\bout\s+for\s+delivery\b", EmailType::Notification),
    (r"(?i)\binvitation:\s", EmailType::Event),
    (r"(?i)\b(?:accepted|declined|updated\s+invitation):\s", EmailType::Event),
    (r"(?i)%\s*off\b", EmailType::Promotion),
    (r"(?i)\b(?:sale\s+ends|flash\s+sale|limited\s+time\s+offer)\b", EmailType::Promotion),
    (r"(?i)\bunsubscribe\b", EmailType::Newsletter),
];

/// Body/snippet phrase → type. Consulted after subject patterns.
pub const BODY_PHRASE_TYPES: &[(&str, EmailType)] = &[
    ("view this email in your browser", EmailType::Newsletter),
    ("you are receiving this because you subscribed", EmailType::Newsletter),
    ("manage your notification settings", EmailType::Notification),
    ("tracking number", EmailType::Notification),
    ("use code", EmailType::Promotion),
];

/// Subject keywords that, combined with an attachment, indicate a receipt.
pub const ATTACHMENT_RECEIPT_KEYWORDS: &[&str] = &["invoice", "receipt", "statement"];

/// OTP subjects/snippets. Checked before every other table.
pub const OTP_PATTERNS: &[&str] = &[
    r"(?i)\b(?:verification|security|login|auth(?:entication)?)\s+code\b",
    r"(?i)\bone[- ]time\s+(?:password|passcode|code)\b",
    r"(?i)\byour\s+code\s+is\b",
    r"(?i)\b\d{4,8}\s+is\s+your\b",
    r"(?i)\bcode\s*:\s*\d{4,8}\b",
];

/// Senders known to mix receipts, promotions, and notifications. Their
/// LLM classifications always go through the verifier.
pub const MULTI_PURPOSE_SENDER_DOMAINS: &[&str] = &[
    "amazon.com",
    "apple.com",
    "google.com",
    "paypal.com",
    "ebay.com",
];

/// An order-number shape inside a message claimed to be a promotion is a
/// contradiction worth a second look.
pub const ORDER_NUMBER_PATTERN: &str = r"(?i)\border\s*#?\s*[A-Z0-9][A-Z0-9-]{2,}\b";
