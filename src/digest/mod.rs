//! The digest pipeline: seven stages over a validated DAG.
//!
//! temporal extraction → intrinsic sections (T0) → temporal decay (T1) →
//! entity extraction → enrichment → synthesis → validation. The pipeline
//! is single-threaded within one session; independent sessions run in
//! parallel and `(user_id, session_id)` single-flight coalescing lives
//! at the HTTP layer.

pub mod context;
pub mod enrich;
pub mod entities;
pub mod links;
pub mod pipeline;
pub mod sections;
pub mod synthesize;
pub mod temporal;
pub mod validate;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::db::Store;
use crate::error::CoreError;
use crate::types::{ClassifiedEmail, DigestResponse, Section, TemporalContext};
use context::{
    DigestContext, SLOT_EMAILS, SLOT_ENRICHED, SLOT_ENTITIES, SLOT_HTML, SLOT_SECTIONS,
    SLOT_TEMPORAL, SLOT_T0_SECTIONS, SLOT_VALIDATED,
};
use pipeline::{Pipeline, Stage, StageDeps, StageFuture};

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

fn stage_temporal_extract<'a>(
    ctx: &'a mut DigestContext,
    _deps: &'a StageDeps,
) -> StageFuture<'a> {
    Box::pin(async move {
        for email in &ctx.emails {
            let extracted = temporal::extract(&email.email.subject, &email.email.snippet);
            ctx.temporal.insert(email.email.id.clone(), extracted);
        }
        Ok(())
    })
}

fn stage_intrinsic_sections<'a>(
    ctx: &'a mut DigestContext,
    _deps: &'a StageDeps,
) -> StageFuture<'a> {
    Box::pin(async move {
        let default = TemporalContext::default();
        for email in &ctx.emails {
            let temporal = ctx.temporal.get(&email.email.id).unwrap_or(&default);
            let section = sections::intrinsic_section(&email.classification, temporal);
            ctx.t0_sections.insert(email.email.id.clone(), section);
        }
        Ok(())
    })
}

fn stage_temporal_decay<'a>(ctx: &'a mut DigestContext, _deps: &'a StageDeps) -> StageFuture<'a> {
    Box::pin(async move {
        let default = TemporalContext::default();
        for email in &ctx.emails {
            let id = &email.email.id;
            let t0 = ctx.t0_sections.get(id).copied().unwrap_or(Section::EverythingElse);
            let temporal = ctx.temporal.get(id).unwrap_or(&default);
            let section = sections::decayed_section(
                t0,
                temporal,
                email.classification.importance,
                ctx.now,
            );
            ctx.sections.insert(id.clone(), section);
        }
        Ok(())
    })
}

fn stage_extract_entities<'a>(ctx: &'a mut DigestContext, deps: &'a StageDeps) -> StageFuture<'a> {
    Box::pin(async move {
        let default = TemporalContext::default();
        let mut extracted = Vec::new();

        for email in &ctx.emails {
            let id = &email.email.id;
            let section = ctx.sections.get(id).copied().unwrap_or(Section::EverythingElse);
            if section == Section::Skip {
                continue;
            }
            let temporal = ctx.temporal.get(id).unwrap_or(&default);
            let mut found = entities::extract_rule_entities(email, temporal);

            // LLM-second: only urgent sections the rules left unstructured.
            if found.is_empty()
                && entities::wants_llm_pass(section)
                && deps.features.is_enabled("llm_entities")
            {
                if let Some(adapter) = &deps.adapter {
                    let sanitized = crate::hygiene::sanitize_email(&email.email);
                    match adapter
                        .extract_entities(&sanitized, email.classification.importance, ctx.now)
                        .await
                    {
                        Ok((llm_entities, _telemetry)) => found = llm_entities,
                        Err(e) => {
                            ctx.warnings
                                .push(format!("entity extraction degraded: {}", e.code()));
                        }
                    }
                }
            }
            extracted.extend(found);
        }

        ctx.entities = entities::dedupe(extracted);
        Ok(())
    })
}

fn stage_enrich<'a>(ctx: &'a mut DigestContext, deps: &'a StageDeps) -> StageFuture<'a> {
    Box::pin(async move {
        let local = ctx.now.with_timezone(&ctx.timezone);
        let greeting = deps
            .greeting_source
            .as_ref()
            .filter(|_| deps.features.is_enabled("weather_greeting"))
            .and_then(|source| source.greeting(local))
            .unwrap_or_else(|| enrich::static_greeting(ctx.now, ctx.timezone));
        ctx.greeting = Some(greeting);

        let entities = std::mem::take(&mut ctx.entities);
        let mut enriched = Vec::with_capacity(entities.len());
        for entity in &entities {
            let section = ctx
                .sections
                .get(&entity.core.source_message_id)
                .copied()
                .unwrap_or(Section::EverythingElse);
            enriched.push(enrich::enrich_entity(
                entity.clone(),
                section,
                &ctx.user_id,
                ctx.now,
                ctx.timezone,
                &deps.links,
            ));
        }
        ctx.entities = entities;
        ctx.enriched = enriched;
        Ok(())
    })
}

fn stage_synthesize<'a>(ctx: &'a mut DigestContext, _deps: &'a StageDeps) -> StageFuture<'a> {
    Box::pin(async move {
        let html = synthesize::render(ctx);
        ctx.html = Some(html);
        Ok(())
    })
}

fn stage_validate<'a>(ctx: &'a mut DigestContext, deps: &'a StageDeps) -> StageFuture<'a> {
    Box::pin(async move { validate::validate(ctx, &deps.links) })
}

/// The production stage graph.
pub fn standard_pipeline() -> Result<Pipeline, CoreError> {
    Pipeline::new(vec![
        Stage {
            name: "temporal_extract",
            depends_on: &[],
            inputs: &[SLOT_EMAILS],
            outputs: &[SLOT_TEMPORAL],
            run: stage_temporal_extract,
        },
        Stage {
            name: "intrinsic_sections",
            depends_on: &["temporal_extract"],
            inputs: &[SLOT_EMAILS, SLOT_TEMPORAL],
            outputs: &[SLOT_T0_SECTIONS],
            run: stage_intrinsic_sections,
        },
        Stage {
            name: "temporal_decay",
            depends_on: &["intrinsic_sections"],
            inputs: &[SLOT_EMAILS, SLOT_TEMPORAL, SLOT_T0_SECTIONS],
            outputs: &[SLOT_SECTIONS],
            run: stage_temporal_decay,
        },
        Stage {
            name: "extract_entities",
            depends_on: &["temporal_decay"],
            inputs: &[SLOT_EMAILS, SLOT_TEMPORAL, SLOT_SECTIONS],
            outputs: &[SLOT_ENTITIES],
            run: stage_extract_entities,
        },
        Stage {
            name: "enrich",
            depends_on: &["extract_entities"],
            inputs: &[SLOT_EMAILS, SLOT_ENTITIES, SLOT_SECTIONS],
            outputs: &[SLOT_ENRICHED],
            run: stage_enrich,
        },
        Stage {
            name: "synthesize",
            depends_on: &["enrich"],
            inputs: &[SLOT_EMAILS, SLOT_ENRICHED],
            outputs: &[SLOT_HTML],
            run: stage_synthesize,
        },
        Stage {
            name: "validate",
            depends_on: &["synthesize"],
            inputs: &[SLOT_HTML],
            outputs: &[SLOT_VALIDATED],
            run: stage_validate,
        },
    ])
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run one digest session end to end: session row, pipeline, fallback on
/// abort, audit finalize.
pub async fn run_digest(
    store: &Arc<Store>,
    deps: &StageDeps,
    user_id: &str,
    session_id: &str,
    emails: Vec<ClassifiedEmail>,
    timezone: Tz,
    now: DateTime<Utc>,
) -> Result<DigestResponse, CoreError> {
    for email in &emails {
        email.classification.validate()?;
        if email.classification.message_id != email.email.id {
            return Err(CoreError::InvalidInput(format!(
                "classification does not match message {}",
                crate::hygiene::hash_pii(&email.email.id)
            )));
        }
    }

    if store.get_session(user_id, session_id)?.is_some() {
        return Err(CoreError::InvalidInput("session id already used".to_string()));
    }

    let input_ids: Vec<String> = emails.iter().map(|e| e.email.id.clone()).collect();
    store.insert_session_running(user_id, session_id, now, timezone.name(), &input_ids)?;

    let mut ctx = DigestContext::new(
        user_id.to_string(),
        session_id.to_string(),
        now,
        timezone,
        emails,
    );

    let pipeline = standard_pipeline()?;
    match pipeline.run(&mut ctx, deps).await {
        Ok(()) => {}
        Err(CoreError::ContractViolation(detail)) => {
            // Broken render is worse than a minimal one: fall back to
            // section counts only.
            tracing::warn!(detail = %crate::hygiene::hash_pii(&detail), "digest fell back to minimal render");
            ctx.warnings.push("digest degraded to minimal render".to_string());
            let counts: BTreeMap<Section, usize> = ctx
                .section_index()
                .into_iter()
                .map(|(section, ids)| (section, ids.len()))
                .collect();
            let html = synthesize::render_fallback(&counts);
            ctx.html_sha256 = Some(validate::sha256_hex(&html));
            ctx.html = Some(html);
            ctx.rendered_cards.clear();
        }
        Err(e) => return Err(e),
    }

    let html = ctx.html.clone().unwrap_or_else(|| synthesize::render_fallback(&BTreeMap::new()));
    let sha = ctx.html_sha256.clone().unwrap_or_else(|| validate::sha256_hex(&html));

    let timings: BTreeMap<String, u64> = ctx.stage_timings.iter().cloned().collect();
    store.finalize_session(
        user_id,
        session_id,
        &sha,
        &serde_json::to_value(&timings).unwrap_or_default(),
        &serde_json::to_value(ctx.decider_counts()).unwrap_or_default(),
        now,
    )?;

    Ok(DigestResponse {
        html,
        session_id: session_id.to_string(),
        section_index: ctx.section_index(),
        warnings: ctx.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Features;
    use crate::db::test_utils::test_store;
    use crate::digest::links::LinkBuilder;
    use crate::types::*;
    use chrono::TimeZone;

    fn deps() -> StageDeps {
        StageDeps {
            adapter: None,
            features: Arc::new(Features::new()),
            greeting_source: None,
            links: LinkBuilder::new("https://mail.example.com".to_string()),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap()
    }

    fn classified(
        id: &str,
        from: &str,
        subject: &str,
        snippet: &str,
        email_type: EmailType,
        importance: Importance,
        decider: Decider,
    ) -> ClassifiedEmail {
        let client_label = Classification::derive_client_label(email_type, Attention::None);
        ClassifiedEmail {
            email: EmailEnvelope {
                id: id.to_string(),
                from: from.to_string(),
                subject: subject.to_string(),
                snippet: snippet.to_string(),
                headers: None,
            },
            classification: Classification {
                message_id: id.to_string(),
                email_type,
                type_conf: 0.97,
                domains: vec![],
                domain_conf: Default::default(),
                attention: if email_type == EmailType::Otp {
                    Attention::ActionRequired
                } else {
                    Attention::None
                },
                attention_conf: 0.9,
                importance,
                importance_conf: 0.9,
                relationship: Relationship::FromUnknown,
                client_label: if email_type == EmailType::Otp {
                    ClientLabel::ActionRequired
                } else {
                    client_label
                },
                decider,
                reason: "test".to_string(),
                model_version: "m".to_string(),
                prompt_version: "p".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_otp_never_appears_in_digest() {
        let store = Arc::new(test_store());
        let otp = classified(
            "m1",
            "security@bank.example",
            "Your verification code is 123456",
            "Do not share",
            EmailType::Otp,
            Importance::Critical,
            Decider::Detector,
        );

        let response = run_digest(&store, &deps(), "u1", "s1", vec![otp], chrono_tz::UTC, now())
            .await
            .expect("digest");

        assert!(!response.html.contains("123456"), "otp digits must not render");
        for section in [
            Section::Critical,
            Section::Today,
            Section::ComingUp,
            Section::WorthKnowing,
            Section::EverythingElse,
        ] {
            assert!(
                !response.section_index.contains_key(&section)
                    || !response.section_index[&section].contains(&"m1".to_string()),
                "otp must not land in {:?}",
                section
            );
        }
    }

    #[tokio::test]
    async fn test_event_section_depends_only_on_now() {
        let email = || {
            classified(
                "m1",
                "friend@mail.example",
                "Dinner @ Fri Nov 21, 2025 6:30pm",
                "See you there",
                EmailType::Event,
                Importance::TimeSensitive,
                Decider::Llm,
            )
        };

        // 11 days ahead: worth_knowing.
        let store = Arc::new(test_store());
        let response =
            run_digest(&store, &deps(), "u1", "s1", vec![email()], chrono_tz::UTC, now())
                .await
                .expect("digest");
        assert!(response.section_index[&Section::WorthKnowing].contains(&"m1".to_string()));

        // The day before: coming_up.
        let at = Utc.with_ymd_and_hms(2025, 11, 20, 12, 0, 0).unwrap();
        let response =
            run_digest(&store, &deps(), "u1", "s2", vec![email()], chrono_tz::UTC, at)
                .await
                .expect("digest");
        assert!(response.section_index[&Section::ComingUp].contains(&"m1".to_string()));

        // Thirty minutes before: critical.
        let at = Utc.with_ymd_and_hms(2025, 11, 21, 18, 0, 0).unwrap();
        let response =
            run_digest(&store, &deps(), "u1", "s3", vec![email()], chrono_tz::UTC, at)
                .await
                .expect("digest");
        assert!(response.section_index[&Section::Critical].contains(&"m1".to_string()));
    }

    #[tokio::test]
    async fn test_digest_is_byte_identical_for_fixed_input() {
        let email = || {
            vec![
                classified(
                    "m1",
                    "friend@mail.example",
                    "Dinner @ Fri Nov 21, 2025 6:30pm",
                    "",
                    EmailType::Event,
                    Importance::TimeSensitive,
                    Decider::Llm,
                ),
                classified(
                    "m2",
                    "shop@retailer.example",
                    "Order #A-100",
                    "Order placed Nov 8, 2025",
                    EmailType::Receipt,
                    Importance::Routine,
                    Decider::Rule,
                ),
            ]
        };

        let store = Arc::new(test_store());
        let a = run_digest(&store, &deps(), "u1", "s1", email(), chrono_tz::UTC, now())
            .await
            .expect("digest");
        let b = run_digest(&store, &deps(), "u1", "s2", email(), chrono_tz::UTC, now())
            .await
            .expect("digest");
        assert_eq!(a.html, b.html, "same input, same now: byte-identical html");
    }

    #[tokio::test]
    async fn test_session_audit_recorded() {
        let store = Arc::new(test_store());
        let emails = vec![classified(
            "m1",
            "friend@mail.example",
            "Dinner @ Fri Nov 21, 2025 6:30pm",
            "",
            EmailType::Event,
            Importance::TimeSensitive,
            Decider::Llm,
        )];

        let response = run_digest(&store, &deps(), "u1", "s1", emails, chrono_tz::UTC, now())
            .await
            .expect("digest");

        let session = store.get_session("u1", "s1").expect("get").expect("row");
        assert_eq!(session.status, "complete");
        let sha = session.output_html_sha256.expect("hash");
        assert_eq!(sha, validate::sha256_hex(&response.html));
        let timings = session.stage_timings.expect("timings");
        assert!(timings.get("temporal_decay").is_some());
        let counts = session.decider_counts.expect("counts");
        assert_eq!(counts.get("llm").and_then(|v| v.as_u64()), Some(1));
    }

    #[tokio::test]
    async fn test_reused_session_id_rejected() {
        let store = Arc::new(test_store());
        run_digest(&store, &deps(), "u1", "s1", vec![], chrono_tz::UTC, now())
            .await
            .expect("first");
        let second = run_digest(&store, &deps(), "u1", "s1", vec![], chrono_tz::UTC, now()).await;
        assert!(matches!(second, Err(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_mismatched_classification_rejected() {
        let store = Arc::new(test_store());
        let mut email = classified(
            "m1",
            "a@b.example",
            "x",
            "",
            EmailType::Message,
            Importance::Routine,
            Decider::Llm,
        );
        email.classification.message_id = "other".to_string();
        let result =
            run_digest(&store, &deps(), "u1", "s1", vec![email], chrono_tz::UTC, now()).await;
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_standard_pipeline_order() {
        let pipeline = standard_pipeline().expect("valid graph");
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "temporal_extract",
                "intrinsic_sections",
                "temporal_decay",
                "extract_entities",
                "enrich",
                "synthesize",
                "validate",
            ]
        );
    }

    #[tokio::test]
    async fn test_script_in_subject_never_renders_raw() {
        let store = Arc::new(test_store());
        let emails = vec![classified(
            "m1",
            "attacker@evil.example",
            "<script>alert(1)</script> Dinner @ Fri Nov 21, 2025 6:30pm",
            "",
            EmailType::Event,
            Importance::TimeSensitive,
            Decider::Llm,
        )];
        let response = run_digest(&store, &deps(), "u1", "s1", emails, chrono_tz::UTC, now())
            .await
            .expect("digest");
        assert!(!response.html.contains("<script"));
    }
}
