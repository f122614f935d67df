//! Row types shared across the db modules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{
    Attention, Classification, Decider, Domain, EmailType, Importance, Relationship,
};

/// Pattern kinds a learned rule can match on, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    ExactSender,
    SenderDomain,
    SubjectContains,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactSender => "exact_sender",
            Self::SenderDomain => "sender_domain",
            Self::SubjectContains => "subject_contains",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact_sender" => Some(Self::ExactSender),
            "sender_domain" => Some(Self::SenderDomain),
            "subject_contains" => Some(Self::SubjectContains),
            _ => None,
        }
    }

    /// Lower number wins ties at match time.
    pub fn priority(&self) -> i32 {
        match self {
            Self::ExactSender => 0,
            Self::SenderDomain => 1,
            Self::SubjectContains => 2,
        }
    }
}

/// The reusable part of a classification a rule stamps onto matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationTemplate {
    pub email_type: EmailType,
    pub type_conf: f64,
    pub domains: Vec<Domain>,
    pub domain_conf: BTreeMap<Domain, f64>,
    pub attention: Attention,
    pub attention_conf: f64,
    pub importance: Importance,
    pub importance_conf: f64,
}

impl ClassificationTemplate {
    pub fn from_classification(c: &Classification) -> Self {
        Self {
            email_type: c.email_type,
            type_conf: c.type_conf,
            domains: c.domains.clone(),
            domain_conf: c.domain_conf.clone(),
            attention: c.attention,
            attention_conf: c.attention_conf,
            importance: c.importance,
            importance_conf: c.importance_conf,
        }
    }

    /// Expand the template into a full classification for one message.
    pub fn to_classification(
        &self,
        message_id: &str,
        relationship: Relationship,
        decider: Decider,
        type_conf: f64,
        reason: String,
        model_version: &str,
        prompt_version: &str,
    ) -> Classification {
        Classification {
            message_id: message_id.to_string(),
            email_type: self.email_type,
            type_conf,
            domains: self.domains.clone(),
            domain_conf: self.domain_conf.clone(),
            attention: self.attention,
            attention_conf: self.attention_conf,
            importance: self.importance,
            importance_conf: self.importance_conf,
            relationship,
            client_label: Classification::derive_client_label(self.email_type, self.attention),
            decider,
            reason,
            model_version: model_version.to_string(),
            prompt_version: prompt_version.to_string(),
        }
    }
}

/// A learned per-sender rule as stored.
#[derive(Debug, Clone)]
pub struct DbRule {
    pub id: String,
    pub user_id: String,
    pub pattern_type: PatternType,
    pub pattern: String,
    pub template: ClassificationTemplate,
    pub confidence: f64,
    pub use_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// One digest session audit row.
#[derive(Debug, Clone)]
pub struct DbSession {
    pub session_id: String,
    pub user_id: String,
    pub status: String,
    pub now_utc: String,
    pub timezone: String,
    pub input_message_ids: Vec<String>,
    pub output_html_sha256: Option<String>,
    pub stage_timings: Option<serde_json::Value>,
    pub decider_counts: Option<serde_json::Value>,
}
