//! Post-render validation: reference integrity, link whitelist, section
//! counts, snapshot hash.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::digest::context::DigestContext;
use crate::digest::links::LinkBuilder;
use crate::error::CoreError;

fn card_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"id="card-(\d+)""#).expect("card id pattern"))
}

fn lead_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((\d+)\)").expect("reference pattern"))
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"href="([^"]*)""#).expect("href pattern"))
}

pub fn sha256_hex(html: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(html.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate the rendered digest against the context. On success the
/// snapshot hash lands on the context for the session audit.
pub fn validate(ctx: &mut DigestContext, links: &LinkBuilder) -> Result<(), CoreError> {
    let html = ctx
        .html
        .clone()
        .ok_or_else(|| CoreError::ContractViolation("validate ran without html".to_string()))?;

    // (a) Every numbered in-text reference resolves to a rendered card.
    let card_ids: BTreeSet<u64> = card_id_re()
        .captures_iter(&html)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect();
    for caps in lead_ref_re().captures_iter(&html) {
        let n: u64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        if !card_ids.contains(&n) {
            return Err(CoreError::ContractViolation(format!(
                "reference ({}) has no card",
                n
            )));
        }
    }

    // (b) Every link parses and is whitelisted to the provider host.
    for caps in href_re().captures_iter(&html) {
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let unescaped = raw.replace("&amp;", "&");
        if !links.is_whitelisted(&unescaped) {
            return Err(CoreError::ContractViolation(format!(
                "link not whitelisted: {}",
                crate::hygiene::hash_pii(&unescaped)
            )));
        }
    }

    // (c) Rendered card counts match the context's record per section.
    for (section, message_ids) in &ctx.rendered_cards {
        let marker = format!("data-section=\"{}\"", section.as_str());
        let rendered = html.matches(&marker).count();
        if rendered != message_ids.len() {
            return Err(CoreError::ContractViolation(format!(
                "section {} renders {} cards, context says {}",
                section.as_str(),
                rendered,
                message_ids.len()
            )));
        }
    }

    // (d) Snapshot hash for the session audit.
    ctx.html_sha256 = Some(sha256_hex(&html));
    Ok(())
}
