//! Canonical contracts shared across the classifier, the learning loop,
//! and the digest pipeline.
//!
//! Every subsystem that crosses the core boundary serializes through these
//! shapes. Validation fails closed: unknown enum values, negative
//! confidences, and confidences above 1 are rejected.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Classification enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailType {
    Newsletter,
    Notification,
    Receipt,
    Event,
    Promotion,
    Message,
    Otp,
    Uncategorized,
}

impl EmailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Newsletter => "newsletter",
            Self::Notification => "notification",
            Self::Receipt => "receipt",
            Self::Event => "event",
            Self::Promotion => "promotion",
            Self::Message => "message",
            Self::Otp => "otp",
            Self::Uncategorized => "uncategorized",
        }
    }

    /// Parse a wire value. `None` for anything outside the known set —
    /// callers collapse to a safe fallback and count the event.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "newsletter" => Some(Self::Newsletter),
            "notification" => Some(Self::Notification),
            "receipt" => Some(Self::Receipt),
            "event" => Some(Self::Event),
            "promotion" => Some(Self::Promotion),
            "message" => Some(Self::Message),
            "otp" => Some(Self::Otp),
            "uncategorized" => Some(Self::Uncategorized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Finance,
    Shopping,
    Professional,
    Personal,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finance => "finance",
            Self::Shopping => "shopping",
            Self::Professional => "professional",
            Self::Personal => "personal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "finance" => Some(Self::Finance),
            "shopping" => Some(Self::Shopping),
            "professional" => Some(Self::Professional),
            "personal" => Some(Self::Personal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attention {
    ActionRequired,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Critical,
    TimeSensitive,
    Routine,
}

impl Importance {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "time_sensitive" => Some(Self::TimeSensitive),
            "routine" => Some(Self::Routine),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    FromContact,
    FromUnknown,
}

/// Mailbox label applied client-side. Wire values are kebab-case to match
/// the label names the mail extension uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientLabel {
    Receipts,
    ActionRequired,
    Messages,
    EverythingElse,
}

/// Provenance: which tier produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decider {
    TypeMapper,
    Rule,
    Llm,
    Verifier,
    Detector,
    Fallback,
}

impl Decider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TypeMapper => "type_mapper",
            Self::Rule => "rule",
            Self::Llm => "llm",
            Self::Verifier => "verifier",
            Self::Detector => "detector",
            Self::Fallback => "fallback",
        }
    }
}

// ---------------------------------------------------------------------------
// Classification record
// ---------------------------------------------------------------------------

/// The unit the classifier returns and the digest consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub message_id: String,
    #[serde(rename = "type")]
    pub email_type: EmailType,
    pub type_conf: f64,
    pub domains: Vec<Domain>,
    pub domain_conf: BTreeMap<Domain, f64>,
    pub attention: Attention,
    pub attention_conf: f64,
    pub importance: Importance,
    pub importance_conf: f64,
    pub relationship: Relationship,
    pub client_label: ClientLabel,
    pub decider: Decider,
    pub reason: String,
    pub model_version: String,
    pub prompt_version: String,
}

impl Classification {
    /// Strict contract validation. Fails closed on out-of-range
    /// confidences and on the OTP labelling invariant.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, conf) in [
            ("type_conf", self.type_conf),
            ("attention_conf", self.attention_conf),
            ("importance_conf", self.importance_conf),
        ] {
            if !(0.0..=1.0).contains(&conf) || conf.is_nan() {
                return Err(CoreError::InvalidInput(format!(
                    "{} out of range: {}",
                    name, conf
                )));
            }
        }
        for (domain, conf) in &self.domain_conf {
            if !(0.0..=1.0).contains(conf) || conf.is_nan() {
                return Err(CoreError::InvalidInput(format!(
                    "domain_conf[{}] out of range: {}",
                    domain.as_str(),
                    conf
                )));
            }
        }
        if self.email_type == EmailType::Otp && self.client_label != ClientLabel::ActionRequired {
            return Err(CoreError::InvalidInput(
                "otp must carry the action-required label".to_string(),
            ));
        }
        Ok(())
    }

    /// Label derived from type and attention when no explicit label applies.
    pub fn derive_client_label(email_type: EmailType, attention: Attention) -> ClientLabel {
        match (email_type, attention) {
            (EmailType::Otp, _) => ClientLabel::ActionRequired,
            (_, Attention::ActionRequired) => ClientLabel::ActionRequired,
            (EmailType::Receipt, _) => ClientLabel::Receipts,
            (EmailType::Message, _) => ClientLabel::Messages,
            _ => ClientLabel::EverythingElse,
        }
    }
}

// ---------------------------------------------------------------------------
// Temporal context
// ---------------------------------------------------------------------------

/// Intrinsic timestamps extracted from a message. These are facts about
/// the message, never comparisons to "now".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalContext {
    pub event_start: Option<DateTime<Utc>>,
    pub event_end: Option<DateTime<Utc>>,
    pub delivery_date: Option<DateTime<Utc>>,
    pub purchase_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
}

impl TemporalContext {
    pub fn validate(&self) -> Result<(), CoreError> {
        if let (Some(start), Some(end)) = (self.event_start, self.event_end) {
            if end < start {
                return Err(CoreError::InvalidInput(
                    "event_end precedes event_start".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn has_any_timestamp(&self) -> bool {
        self.event_start.is_some()
            || self.event_end.is_some()
            || self.delivery_date.is_some()
            || self.purchase_date.is_some()
            || self.expiration_date.is_some()
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Fields every entity variant carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCore {
    pub source_message_id: String,
    pub source_subject: String,
    pub importance: Importance,
    pub event_time: Option<DateTime<Utc>>,
}

/// Variant-specific payloads. Adding a stage never mutates these; the
/// enricher wraps an `Entity` into an `EnrichedEntity` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKind {
    Flight {
        flight_number: String,
        airline: Option<String>,
    },
    Event {
        title: String,
    },
    Deadline {
        what: String,
    },
    Reminder {
        what: String,
    },
    Delivery {
        tracking_number: String,
        carrier: Option<String>,
    },
    Promo {
        offer: String,
    },
    Notification {
        summary: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(flatten)]
    pub core: EntityCore,
    #[serde(flatten)]
    pub kind: EntityKind,
}

impl Entity {
    /// Promos are routine by construction; the importance argument is
    /// deliberately absent.
    pub fn promo(source_message_id: String, source_subject: String, offer: String) -> Self {
        Self {
            core: EntityCore {
                source_message_id,
                source_subject,
                importance: Importance::Routine,
                event_time: None,
            },
            kind: EntityKind::Promo { offer },
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match &self.kind {
            EntityKind::Flight { .. } => "flight",
            EntityKind::Event { .. } => "event",
            EntityKind::Deadline { .. } => "deadline",
            EntityKind::Reminder { .. } => "reminder",
            EntityKind::Delivery { .. } => "delivery",
            EntityKind::Promo { .. } => "promo",
            EntityKind::Notification { .. } => "notification",
        }
    }

    /// Dedupe key within one message: variant plus the payload field that
    /// identifies the fact.
    pub fn natural_key(&self) -> String {
        match &self.kind {
            EntityKind::Flight { flight_number, .. } => flight_number.clone(),
            EntityKind::Event { title } => title.to_lowercase(),
            EntityKind::Deadline { what } | EntityKind::Reminder { what } => what.to_lowercase(),
            EntityKind::Delivery { tracking_number, .. } => tracking_number.clone(),
            EntityKind::Promo { offer } => offer.to_lowercase(),
            EntityKind::Notification { summary } => summary.to_lowercase(),
        }
    }
}

/// Entity after the enrichment stage: resolved importance mirrors the
/// decayed section, the time label is in the user's timezone, and the
/// deep link is built and escaped centrally.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedEntity {
    #[serde(flatten)]
    pub entity: Entity,
    pub resolved_importance: Importance,
    pub digest_section: Section,
    pub when_label: Option<String>,
    pub link: String,
}

// ---------------------------------------------------------------------------
// Digest sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Critical,
    Today,
    ComingUp,
    WorthKnowing,
    EverythingElse,
    Skip,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Today => "today",
            Self::ComingUp => "coming_up",
            Self::WorthKnowing => "worth_knowing",
            Self::EverythingElse => "everything_else",
            Self::Skip => "skip",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Critical => "Critical now",
            Self::Today => "Today",
            Self::ComingUp => "Coming up",
            Self::WorthKnowing => "Worth knowing",
            Self::EverythingElse => "Everything else",
            Self::Skip => "Skipped",
        }
    }

    /// Render order of the visible sections. `Skip` is never rendered.
    pub const RENDERED: [Section; 5] = [
        Section::Critical,
        Section::Today,
        Section::ComingUp,
        Section::WorthKnowing,
        Section::EverythingElse,
    ];
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// An incoming message as the provider hands it to us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailEnvelope {
    pub id: String,
    pub from: String,
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// Digest input: a message plus its classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedEmail {
    pub email: EmailEnvelope,
    pub classification: Classification,
}

/// What `/digest` returns.
#[derive(Debug, Clone, Serialize)]
pub struct DigestResponse {
    pub html: String,
    pub session_id: String,
    pub section_index: BTreeMap<Section, Vec<String>>,
    pub warnings: Vec<String>,
}
