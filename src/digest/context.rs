//! The typed context threaded through the digest pipeline.
//!
//! Each stage declares the slots it reads and writes; the runtime checks
//! both sides. A slot groups the fields one stage owns (e.g. `enriched`
//! covers the enriched entity list and the greeting).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::types::{ClassifiedEmail, EnrichedEntity, Entity, Section, TemporalContext};

/// Slot names stages declare in `inputs` / `outputs`.
pub const SLOT_EMAILS: &str = "emails";
pub const SLOT_TEMPORAL: &str = "temporal";
pub const SLOT_T0_SECTIONS: &str = "t0_sections";
pub const SLOT_SECTIONS: &str = "sections";
pub const SLOT_ENTITIES: &str = "entities";
pub const SLOT_ENRICHED: &str = "enriched";
pub const SLOT_HTML: &str = "html";
pub const SLOT_VALIDATED: &str = "validated";

pub struct DigestContext {
    pub user_id: String,
    pub session_id: String,
    pub now: DateTime<Utc>,
    pub timezone: Tz,

    /// Input: classified messages. Filled at construction.
    pub emails: Vec<ClassifiedEmail>,

    /// T-ex output: intrinsic timestamps per message id.
    pub temporal: BTreeMap<String, TemporalContext>,
    /// T0 output: clock-free section per message id.
    pub t0_sections: BTreeMap<String, Section>,
    /// T1 output: decayed section per message id.
    pub sections: BTreeMap<String, Section>,
    /// Entity extraction output.
    pub entities: Vec<Entity>,
    /// Enrichment output.
    pub enriched: Vec<EnrichedEntity>,
    pub greeting: Option<String>,
    /// Render output.
    pub html: Option<String>,
    /// Message ids actually rendered per section (after the sender cap).
    pub rendered_cards: BTreeMap<Section, Vec<String>>,
    /// Validation output.
    pub html_sha256: Option<String>,

    pub warnings: Vec<String>,
    pub stage_timings: Vec<(String, u64)>,

    filled: BTreeSet<&'static str>,
}

impl DigestContext {
    pub fn new(
        user_id: String,
        session_id: String,
        now: DateTime<Utc>,
        timezone: Tz,
        emails: Vec<ClassifiedEmail>,
    ) -> Self {
        let mut filled = BTreeSet::new();
        filled.insert(SLOT_EMAILS);
        Self {
            user_id,
            session_id,
            now,
            timezone,
            emails,
            temporal: BTreeMap::new(),
            t0_sections: BTreeMap::new(),
            sections: BTreeMap::new(),
            entities: Vec::new(),
            enriched: Vec::new(),
            greeting: None,
            html: None,
            rendered_cards: BTreeMap::new(),
            html_sha256: None,
            warnings: Vec::new(),
            stage_timings: Vec::new(),
            filled,
        }
    }

    pub fn is_filled(&self, slot: &str) -> bool {
        self.filled.contains(slot)
    }

    pub fn mark_filled(&mut self, slot: &'static str) {
        self.filled.insert(slot);
    }

    pub fn filled_slots(&self) -> BTreeSet<&'static str> {
        self.filled.clone()
    }

    pub fn email_by_id(&self, message_id: &str) -> Option<&ClassifiedEmail> {
        self.emails.iter().find(|e| e.email.id == message_id)
    }

    /// Message ids per visible (non-skip) section, for the response and
    /// the session audit.
    pub fn section_index(&self) -> BTreeMap<Section, Vec<String>> {
        let mut index: BTreeMap<Section, Vec<String>> = BTreeMap::new();
        for (message_id, section) in &self.sections {
            if *section == Section::Skip {
                continue;
            }
            index.entry(*section).or_default().push(message_id.clone());
        }
        index
    }

    /// Decider provenance counts over the input classifications.
    pub fn decider_counts(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for email in &self.emails {
            *counts
                .entry(email.classification.decider.as_str().to_string())
                .or_default() += 1;
        }
        counts
    }
}
