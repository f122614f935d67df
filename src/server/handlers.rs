//! HTTP handlers.
//!
//! Admission runs before anything touches the LLM or storage; a
//! rejected batch has zero side effects. Batch classification fans out
//! over a bounded worker pool and never fails wholesale on per-item LLM
//! errors.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::client_ip::caller_identity;
use super::middleware::ApiError;
use crate::config::{Features, RunEnv};
use crate::error::CoreError;
use crate::state::ServiceState;
use crate::types::{
    Attention, Classification, ClassifiedEmail, ClientLabel, Decider, DigestResponse,
    EmailEnvelope, EmailType, Importance, Relationship,
};

/// Concurrent classification tasks per batch. Overridable via
/// `INBOXOS_CLASSIFY_WORKERS`.
fn classify_workers() -> usize {
    static WORKERS: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *WORKERS.get_or_init(|| {
        std::env::var("INBOXOS_CLASSIFY_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(8)
    })
}

// ---------------------------------------------------------------------------
// /classify
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub user_id: String,
    pub emails: Vec<EmailEnvelope>,
}

#[derive(Debug, Serialize)]
pub struct ClassifyResponse {
    pub results: Vec<Classification>,
}

pub async fn classify(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<ClassifyRequest>,
) -> Result<Json<ClassifyResponse>, ApiError> {
    if request.user_id.is_empty() {
        return Err(CoreError::InvalidInput("user_id is required".to_string()).into());
    }
    if request.emails.len() > state.policy.max_batch_emails {
        return Err(CoreError::InvalidInput(format!(
            "batch exceeds {} emails",
            state.policy.max_batch_emails
        ))
        .into());
    }

    let now = state.clock.now();
    let identity = caller_identity(&headers, connect.map(|c| c.0), &state.trusted_proxies);
    state
        .limiter
        .check_admission(&identity, request.emails.len() as u32, now)?;

    let semaphore = Arc::new(Semaphore::new(classify_workers()));
    let mut join_set = JoinSet::new();
    let total = request.emails.len();

    for (index, email) in request.emails.into_iter().enumerate() {
        let state = state.clone();
        let semaphore = semaphore.clone();
        let user_id = request.user_id.clone();
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = state.classifier.classify(&user_id, &email, now).await;
            (index, email.id, result)
        });
    }

    let mut results: Vec<Option<Classification>> = (0..total).map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        let (index, message_id, result) = joined
            .map_err(|e| CoreError::Internal(format!("classify task panicked: {}", e)))?;
        let classification = match result {
            Ok(c) => c,
            // Per-item failures degrade: the batch never fails wholesale.
            Err(e) => item_fallback(&message_id, &e),
        };
        results[index] = Some(classification);
    }

    let results = results.into_iter().flatten().collect();
    Ok(Json(ClassifyResponse { results }))
}

fn item_fallback(message_id: &str, error: &CoreError) -> Classification {
    Classification {
        message_id: message_id.to_string(),
        email_type: EmailType::Uncategorized,
        type_conf: 0.0,
        domains: Vec::new(),
        domain_conf: Default::default(),
        attention: Attention::None,
        attention_conf: 0.0,
        importance: Importance::Routine,
        importance_conf: 0.0,
        relationship: Relationship::FromUnknown,
        client_label: ClientLabel::EverythingElse,
        decider: Decider::Fallback,
        reason: format!("classification unavailable: {}", error.code()),
        model_version: String::new(),
        prompt_version: String::new(),
    }
}

// ---------------------------------------------------------------------------
// /verify
// ---------------------------------------------------------------------------

fn internal_user() -> String {
    "internal".to_string()
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default = "internal_user")]
    pub user_id: String,
    pub email: EmailEnvelope,
    pub original: Classification,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub verdict: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction: Option<Classification>,
    pub confidence: f64,
}

pub async fn verify(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let now = state.clock.now();
    let identity = caller_identity(&headers, connect.map(|c| c.0), &state.trusted_proxies);
    state.limiter.check_admission(&identity, 1, now)?;

    let sanitized = crate::hygiene::sanitize_email(&request.email);
    let (verdict, telemetry) = state
        .adapter
        .verify_classification(&sanitized, &request.original, now)
        .await?;
    state.store.insert_cost_event(&request.user_id, &telemetry, now).map_err(CoreError::from)?;

    Ok(Json(VerifyResponse {
        verdict: match verdict.verdict {
            crate::llm::schema::VerdictKind::Confirm => "confirm".to_string(),
            crate::llm::schema::VerdictKind::Reject => "reject".to_string(),
        },
        correction: verdict.correction,
        confidence: verdict.confidence,
    }))
}

// ---------------------------------------------------------------------------
// /digest
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DigestRequest {
    pub user_id: String,
    pub messages: Vec<ClassifiedEmail>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub now_override: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn digest(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<DigestRequest>,
) -> Result<Json<DigestResponse>, ApiError> {
    if request.user_id.is_empty() {
        return Err(CoreError::InvalidInput("user_id is required".to_string()).into());
    }
    if request.messages.len() > state.policy.max_batch_emails {
        return Err(CoreError::InvalidInput(format!(
            "digest exceeds {} messages",
            state.policy.max_batch_emails
        ))
        .into());
    }

    let now = match request.now_override {
        Some(_) if state.secrets.env != RunEnv::Test => {
            return Err(
                CoreError::InvalidInput("now_override is allowed in test mode only".to_string())
                    .into(),
            )
        }
        Some(t) => t,
        None => state.clock.now(),
    };

    let timezone: chrono_tz::Tz = match request.timezone.as_deref() {
        None => chrono_tz::UTC,
        Some(name) => name
            .parse()
            .map_err(|_| CoreError::InvalidInput(format!("unknown timezone {}", name)))?,
    };

    let identity = caller_identity(&headers, connect.map(|c| c.0), &state.trusted_proxies);
    state
        .limiter
        .check_admission(&identity, request.messages.len() as u32, now)?;

    let session_id = request
        .session_id
        .unwrap_or_else(|| format!("sess-{}", Uuid::new_v4()));

    // Single-flight: concurrent requests for the same key share one run.
    let flight_key = format!("{}:{}", request.user_id, session_id);
    let cell = state
        .digest_flights
        .entry(flight_key.clone())
        .or_insert_with(|| Arc::new(tokio::sync::OnceCell::new()))
        .clone();

    let deps = state.stage_deps();
    let result = cell
        .get_or_try_init(|| {
            crate::digest::run_digest(
                &state.store,
                &deps,
                &request.user_id,
                &session_id,
                request.messages,
                timezone,
                now,
            )
        })
        .await
        .cloned();

    state.digest_flights.remove(&flight_key);
    Ok(Json(result?))
}

// ---------------------------------------------------------------------------
// /feedback
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub user_id: String,
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub corrected: Classification,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub correction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_rule_id: Option<String>,
}

pub async fn feedback(
    State(state): State<Arc<ServiceState>>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>, ApiError> {
    if request.user_id.is_empty() || request.message_id.is_empty() {
        return Err(
            CoreError::InvalidInput("user_id and message_id are required".to_string()).into(),
        );
    }

    let now = state.clock.now();
    // Prefer the audited original; fall back to an empty one when the
    // message was never classified here.
    let original = state
        .store
        .recent_classification(
            &request.user_id,
            &request.message_id,
            state.policy.dedupe_window_hours,
            now,
        )
        .map_err(CoreError::from)?
        .unwrap_or_else(|| item_fallback(&request.message_id, &CoreError::InvalidInput(
            "no prior classification".to_string(),
        )));

    let outcome = crate::learning::record_and_learn(
        &state.store,
        &request.user_id,
        &request.message_id,
        &request.from,
        &request.subject,
        &original,
        &request.corrected,
        now,
    )?;

    state
        .store
        .insert_feedback(
            &request.user_id,
            &request.message_id,
            "user_confirm",
            &serde_json::json!({"corrected_type": request.corrected.email_type.as_str()}),
            now,
        )
        .map_err(CoreError::from)?;

    Ok(Json(FeedbackResponse {
        correction_id: outcome.correction_id,
        promoted_rule_id: outcome.promoted_rule_id,
    }))
}

// ---------------------------------------------------------------------------
// /health, /config/confidence, admin
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<Arc<ServiceState>>) -> Json<serde_json::Value> {
    let storage_ok = state
        .store
        .with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(crate::db::DbError::from)
        })
        .is_ok();

    Json(serde_json::json!({
        "ok": storage_ok,
        "version": crate::state::VERSION,
        "deps": {
            "llm": state.adapter.model_version(),
            "storage": if storage_ok { "ok" } else { "unavailable" },
        },
    }))
}

pub async fn config_confidence(State(state): State<Arc<ServiceState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "min_type_conf": state.policy.min_type_conf,
        "min_label_conf": state.policy.min_label_conf,
        "type_gate": state.policy.type_gate,
        "domain_gate": state.policy.domain_gate,
        "attention_gate": state.policy.attention_gate,
        "learning_min_conf": state.policy.learning_min_conf,
        "verifier_trigger_lo": state.policy.verifier_trigger_lo,
        "verifier_trigger_hi": state.policy.verifier_trigger_hi,
        "verifier_accept_delta": state.policy.verifier_accept_delta,
    }))
}

pub async fn toggle_feature(
    State(state): State<Arc<ServiceState>>,
    Path((name, action)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !Features::is_known(&name) {
        return Err(CoreError::InvalidInput(format!("unknown feature {}", name)).into());
    }
    let enabled = match action.as_str() {
        "enable" => true,
        "disable" => false,
        other => {
            return Err(CoreError::InvalidInput(format!("unknown action {}", other)).into())
        }
    };
    state.features.set(&name, enabled);
    tracing::info!(feature = %name, enabled, "feature override set (ephemeral)");
    Ok(Json(serde_json::json!({"feature": name, "enabled": enabled})))
}

#[derive(Debug, Deserialize)]
pub struct RulesQuery {
    pub user_id: String,
}

pub async fn list_rules(
    State(state): State<Arc<ServiceState>>,
    Query(query): Query<RulesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rules = state.store.list_rules(&query.user_id).map_err(CoreError::from)?;
    let rows: Vec<serde_json::Value> = rules
        .iter()
        .map(|r| {
            serde_json::json!({
                "id": r.id,
                "pattern_type": r.pattern_type.as_str(),
                "pattern": r.pattern,
                "type": r.template.email_type.as_str(),
                "confidence": r.confidence,
                "use_count": r.use_count,
                "created_at": r.created_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"rules": rows})))
}
