//! Retrying structured-output adapter over an `LlmProvider`.
//!
//! Owns: bounded exponential backoff with jitter on transient failures,
//! no retry on refusals, one stricter "repair" attempt on
//! schema-invalid output, circuit breaker consultation, and cost
//! telemetry. Telemetry carries model/prompt versions and token
//! estimates — never email content.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;

use crate::error::CoreError;
use crate::hygiene::SanitizedEmail;
use crate::limiter::CircuitBreaker;
use crate::llm::schema::{self, VerifierVerdict};
use crate::llm::{LlmProvider, LlmRequest};
use crate::types::{Classification, Entity, Importance, Relationship};

/// Pinned prompt version, recorded on every classification for rollback.
pub const PROMPT_VERSION: &str = "classify-v3";

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 200;

// Rough blended per-megatoken pricing for the cost cap.
const INPUT_USD_PER_MTOK: f64 = 0.30;
const OUTPUT_USD_PER_MTOK: f64 = 1.50;

/// Per-call cost record, persisted to `cost_events`.
#[derive(Debug, Clone)]
pub struct LlmTelemetry {
    pub model_version: String,
    pub prompt_version: String,
    pub input_tokens_est: u32,
    pub output_tokens_est: u32,
    pub duration_ms: u64,
    pub estimated_cost_usd: f64,
}

pub struct LlmAdapter {
    provider: Arc<dyn LlmProvider>,
    breaker: Arc<CircuitBreaker>,
}

impl LlmAdapter {
    pub fn new(provider: Arc<dyn LlmProvider>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { provider, breaker }
    }

    pub fn model_version(&self) -> String {
        self.provider.model_version().to_string()
    }

    /// Primary classification call.
    pub async fn classify_email(
        &self,
        email: &SanitizedEmail,
        relationship: Relationship,
        now: DateTime<Utc>,
    ) -> Result<(Classification, LlmTelemetry), CoreError> {
        let request = LlmRequest {
            schema: schema::CLASSIFY_SCHEMA,
            system: classify_system_prompt(),
            user: classify_user_prompt(email),
            temperature: 0.2,
            max_output_tokens: 400,
        };
        let parse = |value: &Value| {
            schema::parse_classification(
                value,
                &email.message_id,
                relationship,
                self.provider.model_version(),
                PROMPT_VERSION,
            )
        };
        self.call_with_repair(request, now, parse).await
    }

    /// Verifier call: stricter, lower temperature, receives the primary
    /// classification it is challenging.
    pub async fn verify_classification(
        &self,
        email: &SanitizedEmail,
        original: &Classification,
        now: DateTime<Utc>,
    ) -> Result<(VerifierVerdict, LlmTelemetry), CoreError> {
        let request = LlmRequest {
            schema: schema::VERIFY_SCHEMA,
            system: verify_system_prompt(),
            user: format!(
                "Original classification: type={} type_conf={:.2} reason={}\n\n{}",
                original.email_type.as_str(),
                original.type_conf,
                original.reason,
                classify_user_prompt(email)
            ),
            temperature: 0.0,
            max_output_tokens: 500,
        };
        let relationship = original.relationship;
        let message_id = email.message_id.clone();
        let model = self.provider.model_version().to_string();
        let parse = move |value: &Value| {
            schema::parse_verdict(value, &message_id, relationship, &model, PROMPT_VERSION)
        };
        self.call_with_repair(request, now, parse).await
    }

    /// Entity extraction for messages the rule families could not
    /// structure.
    pub async fn extract_entities(
        &self,
        email: &SanitizedEmail,
        importance: Importance,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Entity>, LlmTelemetry), CoreError> {
        let request = LlmRequest {
            schema: schema::ENTITY_SCHEMA,
            system: "Extract structured facts (flights, events, deadlines, deliveries, promos, \
                     notifications) from the email. Output only the entities JSON."
                .to_string(),
            user: classify_user_prompt(email),
            temperature: 0.0,
            max_output_tokens: 600,
        };
        let message_id = email.message_id.clone();
        let subject = email.subject.clone();
        let parse =
            move |value: &Value| schema::parse_entities(value, &message_id, &subject, importance);
        self.call_with_repair(request, now, parse).await
    }

    /// Shared call loop: breaker gate, bounded retries with jitter on
    /// transient failures, a single repair attempt on schema failures.
    async fn call_with_repair<T>(
        &self,
        request: LlmRequest,
        now: DateTime<Utc>,
        parse: impl Fn(&Value) -> Result<T, CoreError>,
    ) -> Result<(T, LlmTelemetry), CoreError> {
        self.breaker.check(now)?;

        match self.call_once(&request, now, &parse).await {
            Ok(result) => Ok(result),
            Err(CoreError::LlmSchemaInvalid(detail)) => {
                tracing::debug!(detail = %crate::hygiene::hash_pii(&detail), "schema repair attempt");
                let repair = LlmRequest {
                    temperature: 0.0,
                    system: format!(
                        "{}\nReturn ONLY a JSON object that exactly matches the {} schema. \
                         No prose, no markdown.",
                        request.system, request.schema
                    ),
                    ..request
                };
                self.call_once(&repair, now, &parse).await
            }
            Err(other) => Err(other),
        }
    }

    async fn call_once<T>(
        &self,
        request: &LlmRequest,
        now: DateTime<Utc>,
        parse: &impl Fn(&Value) -> Result<T, CoreError>,
    ) -> Result<(T, LlmTelemetry), CoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            match self.provider.complete(request).await {
                Ok(raw) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    let telemetry = LlmTelemetry {
                        model_version: self.provider.model_version().to_string(),
                        prompt_version: PROMPT_VERSION.to_string(),
                        input_tokens_est: raw.input_tokens_est,
                        output_tokens_est: raw.output_tokens_est,
                        duration_ms,
                        estimated_cost_usd: estimate_cost(
                            raw.input_tokens_est,
                            raw.output_tokens_est,
                        ),
                    };
                    match parse(&raw.json) {
                        Ok(parsed) => {
                            self.breaker.record_success(now);
                            self.breaker.record_cost(telemetry.estimated_cost_usd, now);
                            tracing::info!(
                                model = %telemetry.model_version,
                                prompt = %telemetry.prompt_version,
                                input_tokens = telemetry.input_tokens_est,
                                output_tokens = telemetry.output_tokens_est,
                                duration_ms = telemetry.duration_ms,
                                "llm call completed"
                            );
                            return Ok((parsed, telemetry));
                        }
                        Err(e) => {
                            // Schema failures still cost money.
                            self.breaker.record_cost(telemetry.estimated_cost_usd, now);
                            self.breaker.record_failure(now);
                            return Err(e);
                        }
                    }
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    self.breaker.record_failure(now);
                    let backoff = backoff_with_jitter(attempt);
                    tracing::debug!(attempt, backoff_ms = backoff, "retrying llm call");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    self.breaker.record_failure(now);
                    return Err(e);
                }
            }
        }
    }
}

fn estimate_cost(input_tokens: u32, output_tokens: u32) -> f64 {
    (input_tokens as f64 * INPUT_USD_PER_MTOK + output_tokens as f64 * OUTPUT_USD_PER_MTOK)
        / 1_000_000.0
}

fn backoff_with_jitter(attempt: u32) -> u64 {
    let base = BASE_BACKOFF_MS * 2u64.pow(attempt.saturating_sub(1));
    base + rand::thread_rng().gen_range(0..=BASE_BACKOFF_MS / 2)
}

fn classify_system_prompt() -> String {
    "Classify the email along four dimensions: type (newsletter, notification, receipt, event, \
     promotion, message, otp, uncategorized), domains (finance, shopping, professional, \
     personal), attention (action_required, none), importance (critical, time_sensitive, \
     routine). Give a confidence in [0,1] for each dimension and a one-line reason."
        .to_string()
}

fn classify_user_prompt(email: &SanitizedEmail) -> String {
    format!(
        "From: {}\nSubject: {}\nSnippet: {}",
        email.from, email.subject, email.snippet
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::llm::{ScriptedFailure, ScriptedProvider};
    use chrono::TimeZone;
    use serde_json::json;

    fn email() -> SanitizedEmail {
        SanitizedEmail {
            message_id: "m1".to_string(),
            from: "shop@retailer.example".to_string(),
            subject: "Order #A-100".to_string(),
            snippet: "Thanks for your order".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap()
    }

    fn classification_json(conf: f64) -> Value {
        json!({
            "type": "receipt",
            "type_conf": conf,
            "domains": {"shopping": 0.8},
            "attention": "none",
            "attention_conf": 0.2,
            "importance": "routine",
            "importance_conf": 0.7,
            "reason": "order confirmation"
        })
    }

    fn adapter_with(provider: Arc<ScriptedProvider>) -> LlmAdapter {
        let breaker = Arc::new(CircuitBreaker::new(&Policy::default()));
        LlmAdapter::new(provider, breaker)
    }

    #[tokio::test]
    async fn test_classify_happy_path() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_ok(classification_json(0.9));
        let adapter = adapter_with(provider.clone());

        let (c, telemetry) = adapter
            .classify_email(&email(), Relationship::FromUnknown, now())
            .await
            .expect("classify");
        assert_eq!(c.email_type, crate::types::EmailType::Receipt);
        assert_eq!(telemetry.prompt_version, PROMPT_VERSION);
        assert!(telemetry.estimated_cost_usd > 0.0);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure(ScriptedFailure::Transient);
        provider.push_ok(classification_json(0.9));
        let adapter = adapter_with(provider.clone());

        let result = adapter
            .classify_email(&email(), Relationship::FromUnknown, now())
            .await;
        assert!(result.is_ok());
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_refusal_does_not_retry() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure(ScriptedFailure::Refused);
        provider.push_ok(classification_json(0.9));
        let adapter = adapter_with(provider.clone());

        let result = adapter
            .classify_email(&email(), Relationship::FromUnknown, now())
            .await;
        assert!(matches!(result, Err(CoreError::LlmRefused)));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_schema_invalid_gets_one_repair_attempt() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_ok(json!({"garbage": true}));
        provider.push_ok(classification_json(0.85));
        let adapter = adapter_with(provider.clone());

        let (c, _) = adapter
            .classify_email(&email(), Relationship::FromUnknown, now())
            .await
            .expect("repair should recover");
        assert_eq!(c.type_conf, 0.85);
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_schema_invalid_twice_fails() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_ok(json!({"garbage": true}));
        provider.push_ok(json!({"still": "garbage"}));
        let adapter = adapter_with(provider.clone());

        let result = adapter
            .classify_email(&email(), Relationship::FromUnknown, now())
            .await;
        assert!(matches!(result, Err(CoreError::LlmSchemaInvalid(_))));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_calls() {
        let provider = Arc::new(ScriptedProvider::new());
        let breaker = Arc::new(CircuitBreaker::new(&Policy {
            daily_cost_cap_usd: 0.000001,
            ..Policy::default()
        }));
        breaker.record_cost(1.0, now());
        let adapter = LlmAdapter::new(provider.clone(), breaker);

        let result = adapter
            .classify_email(&email(), Relationship::FromUnknown, now())
            .await;
        assert!(matches!(result, Err(CoreError::CircuitOpen { .. })));
        assert_eq!(provider.call_count(), 0, "breaker must reject before the provider");
    }

    #[test]
    fn test_cost_estimate_scales_with_tokens() {
        assert!(estimate_cost(1000, 1000) > estimate_cost(100, 100));
        assert!(estimate_cost(0, 0) == 0.0);
    }
}
