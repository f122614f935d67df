//! Deterministic HTML rendering. No LLM anywhere in this path.
//!
//! Every interpolated variable is HTML-escaped; hrefs are additionally
//! attribute-escaped. Output is byte-stable for a fixed `(input, now)`:
//! sections render in a fixed order and entities sort on stable keys.

use std::collections::BTreeMap;

use crate::digest::context::DigestContext;
use crate::digest::links::escape_attr;
use crate::types::{EnrichedEntity, EntityKind, Section};

/// Cards one sender may occupy in a single section.
pub const PER_SENDER_CARD_CAP: usize = 3;

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

fn card_title(entity: &EnrichedEntity) -> String {
    match &entity.entity.kind {
        EntityKind::Flight { flight_number, .. } => format!("Flight {}", flight_number),
        EntityKind::Event { title } => title.clone(),
        EntityKind::Deadline { what } => what.clone(),
        EntityKind::Reminder { what } => what.clone(),
        EntityKind::Delivery { tracking_number, .. } => format!("Delivery {}", tracking_number),
        EntityKind::Promo { offer } => offer.clone(),
        EntityKind::Notification { summary } => summary.clone(),
    }
}

/// Render the digest. Also records which message ids made it onto cards
/// per section (after the per-sender cap) on the context.
pub fn render(ctx: &mut DigestContext) -> String {
    // Sender lookup for the cap.
    let sender_of: BTreeMap<&str, &str> = ctx
        .emails
        .iter()
        .map(|e| (e.email.id.as_str(), e.email.from.as_str()))
        .collect();

    // Group enriched entities per section with a stable sort:
    // (event time, source message, natural key).
    let mut by_section: BTreeMap<Section, Vec<&EnrichedEntity>> = BTreeMap::new();
    for entity in &ctx.enriched {
        if entity.digest_section == Section::Skip {
            continue;
        }
        by_section.entry(entity.digest_section).or_default().push(entity);
    }
    for entities in by_section.values_mut() {
        entities.sort_by(|a, b| {
            let key_a = (
                a.entity.core.event_time,
                a.entity.core.source_message_id.as_str(),
                a.entity.natural_key(),
            );
            let key_b = (
                b.entity.core.event_time,
                b.entity.core.source_message_id.as_str(),
                b.entity.natural_key(),
            );
            key_a.cmp(&key_b)
        });
    }

    let mut rendered_cards: BTreeMap<Section, Vec<String>> = BTreeMap::new();
    let mut body = String::new();
    let mut card_number = 0usize;
    let mut lead_refs: Vec<(Section, usize)> = Vec::new();

    for section in Section::RENDERED {
        let Some(entities) = by_section.get(&section) else { continue };
        if entities.is_empty() {
            continue;
        }

        let mut sender_counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut cards = String::new();
        let mut section_card_ids: Vec<String> = Vec::new();

        for entity in entities {
            let message_id = entity.entity.core.source_message_id.as_str();
            let sender = sender_of.get(message_id).copied().unwrap_or("");
            let count = sender_counts.entry(sender).or_default();
            if *count >= PER_SENDER_CARD_CAP {
                continue; // one sender must not swamp a section
            }
            *count += 1;

            card_number += 1;
            if section_card_ids.is_empty() {
                lead_refs.push((section, card_number));
            }
            section_card_ids.push(message_id.to_string());

            let when = entity
                .when_label
                .as_deref()
                .map(|w| format!("<p class=\"when\">{}</p>", escape_html(w)))
                .unwrap_or_default();
            let link = if entity.link.is_empty() {
                String::new()
            } else {
                format!("<a href=\"{}\">Open</a>", escape_attr(&entity.link))
            };
            cards.push_str(&format!(
                "<div class=\"card\" data-section=\"{}\" id=\"card-{}\"><h3>{}</h3>{}{}</div>",
                section.as_str(),
                card_number,
                escape_html(&card_title(entity)),
                when,
                link,
            ));
        }

        if section_card_ids.is_empty() {
            continue;
        }
        body.push_str(&format!(
            "<section id=\"section-{}\"><h2>{}</h2>{}</section>",
            section.as_str(),
            escape_html(section.title()),
            cards,
        ));
        rendered_cards.insert(section, section_card_ids);
    }

    let greeting = ctx.greeting.clone().unwrap_or_else(|| "Here is your inbox.".to_string());
    let lead = if lead_refs.is_empty() {
        "Nothing needs your attention right now.".to_string()
    } else {
        let parts: Vec<String> = lead_refs
            .iter()
            .map(|(section, number)| {
                format!(
                    "{} ({})",
                    escape_html(section.title().to_lowercase().as_str()),
                    number
                )
            })
            .collect();
        format!("Start with {}.", parts.join(", then "))
    };

    let html = format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Inbox digest</title></head>\
         <body><p class=\"greeting\">{}</p><p class=\"lead\">{}</p>{}</body></html>",
        escape_html(&greeting),
        lead,
        body,
    );

    ctx.rendered_cards = rendered_cards;
    html
}

/// Deterministic minimal digest: section counts only. Used when the
/// pipeline aborts or validation rejects the full render.
pub fn render_fallback(section_counts: &BTreeMap<Section, usize>) -> String {
    let mut items = String::new();
    for section in Section::RENDERED {
        let count = section_counts.get(&section).copied().unwrap_or(0);
        items.push_str(&format!(
            "<li>{}: {}</li>",
            escape_html(section.title()),
            count
        ));
    }
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Inbox digest</title></head>\
         <body><p class=\"greeting\">Here is your inbox.</p><ul>{}</ul></body></html>",
        items
    )
}
