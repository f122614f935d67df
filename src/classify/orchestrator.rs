//! Classifier orchestration: the tier walk.
//!
//! Type mapper → learned rules → LLM → (verifier) → confidence gate →
//! learning hook. Each tier strictly precedes the next; learning writes
//! happen only after the final classification is decided. Classification
//! is pure per message; batching is the caller's concern and goes
//! through the admission limiter first.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::constants::{MULTI_PURPOSE_SENDER_DOMAINS, ORDER_NUMBER_PATTERN};
use super::type_mapper::{self, extract_domain, extract_email_address};
use super::verifier;
use crate::config::{Features, Policy};
use crate::db::Store;
use crate::error::CoreError;
use crate::hygiene;
use crate::llm::adapter::LlmAdapter;
use crate::types::{
    Attention, Classification, ClientLabel, Decider, EmailEnvelope, EmailType, Relationship,
};

pub struct Classifier {
    store: Arc<Store>,
    adapter: Arc<LlmAdapter>,
    policy: Arc<Policy>,
    features: Arc<Features>,
}

impl Classifier {
    pub fn new(
        store: Arc<Store>,
        adapter: Arc<LlmAdapter>,
        policy: Arc<Policy>,
        features: Arc<Features>,
    ) -> Self {
        Self { store, adapter, policy, features }
    }

    /// Classify one message. Deterministic tiers run first; the LLM is
    /// the last resort and its failures degrade to a fallback result
    /// rather than an error.
    pub async fn classify(
        &self,
        user_id: &str,
        envelope: &EmailEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Classification, CoreError> {
        if envelope.id.is_empty() || envelope.from.is_empty() {
            return Err(CoreError::InvalidInput("message id and from are required".to_string()));
        }

        // Idempotence: a message classified inside the dedupe window is
        // served from the audit table, with no new learning writes.
        if let Some(previous) = self.store.recent_classification(
            user_id,
            &envelope.id,
            self.policy.dedupe_window_hours,
            now,
        )? {
            tracing::debug!(message = %hygiene::hash_pii(&envelope.id), "dedupe window hit");
            return Ok(previous);
        }

        let relationship = infer_relationship(envelope);

        // Tier 0: deterministic tables.
        if let Some(matched) = type_mapper::match_email(envelope) {
            let classification = self.expand_type_match(envelope, relationship, matched);
            let gated = self.gate(classification);
            gated.validate()?;
            self.store.insert_classification(user_id, &gated, now)?;
            return Ok(gated);
        }

        // Tier 1: the user's learned rules. The usage increment is part
        // of the match and commits before we return.
        if let Some(rule) = self
            .store
            .match_and_track_usage(user_id, &envelope.from, &envelope.subject, now)?
        {
            let classification = rule.template.to_classification(
                &envelope.id,
                relationship,
                Decider::Rule,
                rule.confidence,
                format!("learned {} rule", rule.pattern_type.as_str()),
                &self.adapter.model_version(),
                crate::llm::adapter::PROMPT_VERSION,
            );
            let gated = self.gate(classification);
            gated.validate()?;
            self.store.insert_classification(user_id, &gated, now)?;
            return Ok(gated);
        }

        // Tier 2: the language model.
        let sanitized = hygiene::sanitize_email(envelope);
        let (mut classification, telemetry) =
            match self.adapter.classify_email(&sanitized, relationship, now).await {
                Ok(ok) => ok,
                Err(e) if e.is_llm_failure() => {
                    tracing::warn!(code = e.code(), "llm tier failed, returning fallback");
                    return Ok(fallback_classification(envelope, relationship, &e));
                }
                Err(e) => return Err(e),
            };
        self.store.insert_cost_event(user_id, &telemetry, now)?;

        // Tier 3: selective verification.
        if self.features.is_enabled("verifier") && self.verifier_trigger(envelope, &classification)
        {
            match verifier::reconsider(
                &self.adapter,
                &self.store,
                &self.policy,
                user_id,
                &sanitized,
                classification.clone(),
                now,
            )
            .await
            {
                Ok(outcome) => classification = outcome.classification,
                Err(e) => {
                    // A broken verifier never blocks the primary result.
                    tracing::warn!(code = e.code(), "verifier failed, keeping primary");
                }
            }
        }

        let gated = self.gate(classification);
        gated.validate()?;

        if self.learn_eligible(&gated) {
            if let Err(e) =
                crate::learning::record_candidate(&self.store, user_id, &envelope.from, &gated, now)
            {
                tracing::warn!(code = e.code(), "candidate write failed");
            }
        }

        self.store.insert_classification(user_id, &gated, now)?;
        Ok(gated)
    }

    /// Confidence gate. Comparisons are strict-below: a result at
    /// exactly the threshold is accepted. `min_type_conf` and
    /// `type_gate` are combined with max, so raising either can only
    /// demote.
    fn gate(&self, mut c: Classification) -> Classification {
        let type_gate = self.policy.min_type_conf.max(self.policy.type_gate);
        if c.type_conf < type_gate {
            c.email_type = EmailType::Uncategorized;
            c.client_label = ClientLabel::EverythingElse;
            if !c.reason.contains("below type gate") {
                c.reason = format!("{} (below type gate)", c.reason);
            }
            return c;
        }

        let domain_gate = self.policy.domain_gate;
        c.domains.retain(|d| c.domain_conf.get(d).copied().unwrap_or(0.0) >= domain_gate);
        c.domain_conf.retain(|_, conf| *conf >= domain_gate);

        if c.attention == Attention::ActionRequired && c.attention_conf < self.policy.attention_gate
        {
            c.attention = Attention::None;
            c.client_label = Classification::derive_client_label(c.email_type, c.attention);
        }

        // Label gate: a mailbox label backed by less confidence than
        // min_label_conf falls back to the catch-all. OTP keeps its
        // label unconditionally.
        if c.email_type != EmailType::Otp {
            let label_conf = if c.client_label == ClientLabel::ActionRequired {
                c.attention_conf
            } else {
                c.type_conf
            };
            if label_conf < self.policy.min_label_conf {
                c.client_label = ClientLabel::EverythingElse;
            }
        }
        c
    }

    /// The verifier fires on the medium-confidence band (inclusive), on a
    /// detected contradiction, and on known multi-purpose senders.
    fn verifier_trigger(&self, envelope: &EmailEnvelope, c: &Classification) -> bool {
        let in_band = c.type_conf >= self.policy.verifier_trigger_lo
            && c.type_conf <= self.policy.verifier_trigger_hi;
        if in_band {
            return true;
        }

        if c.email_type == EmailType::Promotion {
            static ORDER_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
            let order_re = ORDER_RE
                .get_or_init(|| regex::Regex::new(ORDER_NUMBER_PATTERN).expect("order pattern"));
            if order_re.is_match(&envelope.subject) || order_re.is_match(&envelope.snippet) {
                return true;
            }
        }

        let domain = extract_domain(&extract_email_address(&envelope.from));
        MULTI_PURPOSE_SENDER_DOMAINS.contains(&domain.as_str())
    }

    fn learn_eligible(&self, c: &Classification) -> bool {
        self.features.is_enabled("learning")
            && matches!(c.decider, Decider::Llm | Decider::Verifier)
            && c.type_conf >= self.policy.learning_min_conf
            && c.email_type != EmailType::Uncategorized
    }

    fn expand_type_match(
        &self,
        envelope: &EmailEnvelope,
        relationship: Relationship,
        matched: type_mapper::TypeMatch,
    ) -> Classification {
        let attention = if matched.email_type == EmailType::Otp {
            Attention::ActionRequired
        } else {
            Attention::None
        };
        Classification {
            message_id: envelope.id.clone(),
            email_type: matched.email_type,
            type_conf: matched.confidence,
            domains: Vec::new(),
            domain_conf: Default::default(),
            attention,
            attention_conf: matched.confidence,
            importance: matched.importance,
            importance_conf: matched.confidence,
            relationship,
            client_label: Classification::derive_client_label(matched.email_type, attention),
            decider: matched.decider,
            reason: matched.reason,
            model_version: self.adapter.model_version(),
            prompt_version: crate::llm::adapter::PROMPT_VERSION.to_string(),
        }
    }
}

/// Reply-thread headers are the only deterministic contact signal the
/// envelope carries.
fn infer_relationship(envelope: &EmailEnvelope) -> Relationship {
    let is_reply = envelope
        .headers
        .as_ref()
        .map(|h| h.keys().any(|k| {
            k.eq_ignore_ascii_case("in-reply-to") || k.eq_ignore_ascii_case("references")
        }))
        .unwrap_or(false);
    if is_reply {
        Relationship::FromContact
    } else {
        Relationship::FromUnknown
    }
}

/// Returned when the LLM tier is unavailable. Never learned from, never
/// audited, safe to retry later.
fn fallback_classification(
    envelope: &EmailEnvelope,
    relationship: Relationship,
    error: &CoreError,
) -> Classification {
    Classification {
        message_id: envelope.id.clone(),
        email_type: EmailType::Uncategorized,
        type_conf: 0.0,
        domains: Vec::new(),
        domain_conf: Default::default(),
        attention: Attention::None,
        attention_conf: 0.0,
        importance: crate::types::Importance::Routine,
        importance_conf: 0.0,
        relationship,
        client_label: ClientLabel::EverythingElse,
        decider: Decider::Fallback,
        reason: format!("llm unavailable: {}", error.code()),
        model_version: String::new(),
        prompt_version: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_store;
    use crate::limiter::CircuitBreaker;
    use crate::llm::{ScriptedFailure, ScriptedProvider};
    use chrono::TimeZone;
    use serde_json::json;

    struct Setup {
        classifier: Classifier,
        provider: Arc<ScriptedProvider>,
        store: Arc<Store>,
    }

    fn setup() -> Setup {
        setup_with_policy(Policy::default())
    }

    fn setup_with_policy(policy: Policy) -> Setup {
        let provider = Arc::new(ScriptedProvider::new());
        let breaker = Arc::new(CircuitBreaker::new(&policy));
        let adapter = Arc::new(LlmAdapter::new(provider.clone(), breaker));
        let store = Arc::new(test_store());
        let classifier = Classifier::new(
            store.clone(),
            adapter,
            Arc::new(policy),
            Arc::new(Features::new()),
        );
        Setup { classifier, provider, store }
    }

    fn envelope(id: &str, from: &str, subject: &str, snippet: &str) -> EmailEnvelope {
        EmailEnvelope {
            id: id.to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            snippet: snippet.to_string(),
            headers: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap()
    }

    fn llm_json(email_type: &str, conf: f64) -> serde_json::Value {
        json!({
            "type": email_type,
            "type_conf": conf,
            "domains": {"shopping": 0.8},
            "attention": "none",
            "attention_conf": 0.2,
            "importance": "routine",
            "importance_conf": 0.7,
            "reason": "model says so"
        })
    }

    #[tokio::test]
    async fn test_otp_detector_end_to_end() {
        let s = setup();
        let c = s
            .classifier
            .classify(
                "u1",
                &envelope(
                    "m1",
                    "security@bank.example",
                    "Your verification code is 123456",
                    "Do not share",
                ),
                now(),
            )
            .await
            .expect("classify");

        assert_eq!(c.email_type, EmailType::Otp);
        assert_eq!(c.client_label, ClientLabel::ActionRequired);
        assert_eq!(c.decider, Decider::Detector);
        assert_eq!(c.importance, crate::types::Importance::Critical);
        assert!(c.type_conf >= 0.95);
        assert_eq!(s.provider.call_count(), 0, "no llm call for detector matches");
    }

    #[tokio::test]
    async fn test_gate_demotes_uncertain_llm() {
        let s = setup();
        // 0.68 sits inside the verifier band; the verifier confirms, and
        // the gate still demotes below min_type_conf.
        s.provider.push_ok(llm_json("newsletter", 0.68));
        s.provider.push_ok(json!({"verdict": "confirm", "confidence": 0.9}));

        let c = s
            .classifier
            .classify("u1", &envelope("m1", "news@blog.example", "Stuff", "hello"), now())
            .await
            .expect("classify");

        assert_eq!(c.email_type, EmailType::Uncategorized);
        assert_eq!(c.client_label, ClientLabel::EverythingElse);
        assert_eq!(c.decider, Decider::Llm);
        assert!(c.reason.contains("below type gate"));
    }

    #[tokio::test]
    async fn test_gate_is_inclusive_at_threshold() {
        let s = setup();
        // 0.70 == min_type_conf exactly: accepted. Band hi is 0.85 so the
        // verifier fires; let it confirm.
        s.provider.push_ok(llm_json("newsletter", 0.70));
        s.provider.push_ok(json!({"verdict": "confirm", "confidence": 0.9}));

        let c = s
            .classifier
            .classify("u1", &envelope("m1", "news@blog.example", "Stuff", "hello"), now())
            .await
            .expect("classify");

        assert_eq!(c.email_type, EmailType::Newsletter, "threshold is inclusive");
    }

    #[tokio::test]
    async fn test_llm_failure_returns_fallback() {
        let s = setup();
        for _ in 0..3 {
            s.provider.push_failure(ScriptedFailure::Transient);
        }

        let c = s
            .classifier
            .classify("u1", &envelope("m1", "who@where.example", "Hi", "hello"), now())
            .await
            .expect("fallback, not error");

        assert_eq!(c.decider, Decider::Fallback);
        assert_eq!(c.email_type, EmailType::Uncategorized);
        assert_eq!(c.type_conf, 0.0);
        // Fallbacks are not audited: nothing enters the dedupe window and
        // no learning happens.
        assert_eq!(s.store.classification_count("u1").unwrap(), 0);
        assert_eq!(s.store.learned_pattern_count("u1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_verifier_rejects_and_corrects() {
        let s = setup();
        // Primary: promotion at 0.72 on a message with an order number.
        s.provider.push_ok(llm_json("promotion", 0.72));
        s.provider.push_ok(json!({
            "verdict": "reject",
            "confidence": 0.9,
            "correction": llm_json("receipt", 0.90),
        }));

        let c = s
            .classifier
            .classify(
                "u1",
                &envelope(
                    "m1",
                    "store@shop.example",
                    "Thanks for shopping with us",
                    "Ref order# B77X, ships this week",
                ),
                now(),
            )
            .await
            .expect("classify");

        assert_eq!(c.email_type, EmailType::Receipt);
        assert_eq!(c.decider, Decider::Verifier);
        assert_eq!(s.provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_high_confidence_skips_verifier() {
        let s = setup();
        s.provider.push_ok(llm_json("message", 0.95));

        let c = s
            .classifier
            .classify("u1", &envelope("m1", "friend@mail.example", "hey", "lunch?"), now())
            .await
            .expect("classify");

        assert_eq!(c.email_type, EmailType::Message);
        assert_eq!(c.decider, Decider::Llm);
        assert_eq!(s.provider.call_count(), 1, "above the band: no verifier call");
    }

    #[tokio::test]
    async fn test_learned_rule_skips_llm_on_repeat() {
        let s = setup();
        // First classification: LLM decides receipt at 0.9 (learn-eligible,
        // above the verifier band).
        s.provider.push_ok(llm_json("receipt", 0.9));
        let first = s
            .classifier
            .classify(
                "u1",
                &envelope("m1", "auto-confirm@retailer.example", "Order #A-100", ""),
                now(),
            )
            .await
            .expect("classify");
        assert_eq!(first.decider, Decider::Llm);

        // Confirmation via feedback promotes the candidate to a rule.
        crate::learning::record_and_learn(
            &s.store,
            "u1",
            "m1",
            "auto-confirm@retailer.example",
            "Order #A-100",
            &first,
            &first,
            now(),
        )
        .expect("learn");

        // A fresh message from the same sender: decider=rule, no LLM call.
        let calls_before = s.provider.call_count();
        let second = s
            .classifier
            .classify(
                "u1",
                &envelope("m2", "auto-confirm@retailer.example", "Order #A-101", ""),
                now(),
            )
            .await
            .expect("classify");

        assert_eq!(second.decider, Decider::Rule);
        assert_eq!(second.email_type, EmailType::Receipt);
        assert_eq!(s.provider.call_count(), calls_before, "no llm call in telemetry");
    }

    #[tokio::test]
    async fn test_dedupe_window_is_idempotent() {
        let s = setup();
        s.provider.push_ok(llm_json("message", 0.95));

        let env = envelope("m1", "friend@mail.example", "hey", "lunch?");
        let first = s.classifier.classify("u1", &env, now()).await.expect("classify");
        let second = s.classifier.classify("u1", &env, now()).await.expect("classify");

        assert_eq!(first.email_type, second.email_type);
        assert_eq!(first.decider, second.decider);
        assert_eq!(s.provider.call_count(), 1, "second submit served from audit");
        assert_eq!(s.store.classification_count("u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_gate_monotonicity() {
        // Raising the type gate can only push results toward
        // uncategorized, never the reverse.
        let lenient = setup_with_policy(Policy {
            min_type_conf: 0.60,
            type_gate: 0.60,
            ..Policy::default()
        });
        lenient.provider.push_ok(llm_json("newsletter", 0.65));
        lenient.provider.push_ok(json!({"verdict": "confirm", "confidence": 0.9}));
        let c_lenient = lenient
            .classifier
            .classify("u1", &envelope("m1", "news@blog.example", "Stuff", ""), now())
            .await
            .expect("classify");

        let strict = setup_with_policy(Policy {
            min_type_conf: 0.90,
            type_gate: 0.90,
            ..Policy::default()
        });
        strict.provider.push_ok(llm_json("newsletter", 0.65));
        strict.provider.push_ok(json!({"verdict": "confirm", "confidence": 0.9}));
        let c_strict = strict
            .classifier
            .classify("u1", &envelope("m1", "news@blog.example", "Stuff", ""), now())
            .await
            .expect("classify");

        assert_eq!(c_lenient.email_type, EmailType::Newsletter);
        assert_eq!(c_strict.email_type, EmailType::Uncategorized);
    }

    #[tokio::test]
    async fn test_low_attention_conf_is_dropped() {
        let s = setup();
        let mut v = llm_json("message", 0.9);
        v["attention"] = json!("action_required");
        v["attention_conf"] = json!(0.3); // below attention_gate 0.5
        s.provider.push_ok(v);

        let c = s
            .classifier
            .classify("u1", &envelope("m1", "friend@mail.example", "hey", ""), now())
            .await
            .expect("classify");
        assert_eq!(c.attention, Attention::None);
        assert_eq!(c.client_label, ClientLabel::Messages);
    }

    #[tokio::test]
    async fn test_sub_gate_domains_dropped() {
        let s = setup();
        let mut v = llm_json("message", 0.9);
        v["domains"] = json!({"shopping": 0.9, "finance": 0.2});
        s.provider.push_ok(v);

        let c = s
            .classifier
            .classify("u1", &envelope("m1", "friend@mail.example", "hey", ""), now())
            .await
            .expect("classify");
        assert_eq!(c.domains, vec![crate::types::Domain::Shopping]);
        assert!(!c.domain_conf.contains_key(&crate::types::Domain::Finance));
    }
}
