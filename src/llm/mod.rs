//! Language-model access.
//!
//! The core never talks to a vendor SDK directly. Everything goes through
//! the dyn-compatible `LlmProvider` trait so tests inject a scripted
//! provider and the adapter owns retries, deadlines, and schema
//! validation in one place.

pub mod adapter;
pub mod schema;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::CoreError;

/// One structured-output request. `schema` names the output contract the
/// provider is asked to honor; the adapter validates the result anyway.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub schema: &'static str,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Raw provider output plus token estimates for cost tracking.
#[derive(Debug, Clone)]
pub struct LlmRaw {
    pub json: Value,
    pub input_tokens_est: u32,
    pub output_tokens_est: u32,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, req: &LlmRequest) -> Result<LlmRaw, CoreError>;
    fn model_version(&self) -> &str;
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

/// Generic JSON-over-HTTP provider. The endpoint is expected to accept
/// `{model, schema, system, user, temperature, max_output_tokens}` and
/// answer `{output: <json>, usage: {input_tokens, output_tokens}}`.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    call_timeout: Duration,
}

impl HttpLlmProvider {
    pub fn new(endpoint: String, api_key: String, model: String, call_timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
            call_timeout: Duration::from_millis(call_timeout_ms),
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn complete(&self, req: &LlmRequest) -> Result<LlmRaw, CoreError> {
        let body = serde_json::json!({
            "model": self.model,
            "schema": req.schema,
            "system": req.system,
            "user": req.user,
            "temperature": req.temperature,
            "max_output_tokens": req.max_output_tokens,
        });

        let send = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = match tokio::time::timeout(self.call_timeout, send).await {
            Err(_) => return Err(CoreError::LlmTimeout(self.call_timeout.as_millis() as u64)),
            Ok(Err(e)) if e.is_timeout() => {
                return Err(CoreError::LlmTimeout(self.call_timeout.as_millis() as u64))
            }
            Ok(Err(e)) => return Err(CoreError::LlmTransient(e.to_string())),
            Ok(Ok(resp)) => resp,
        };

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CoreError::LlmTransient(format!("status {}", status)));
        }
        if status.is_client_error() {
            return Err(CoreError::LlmRefused);
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CoreError::LlmSchemaInvalid(format!("non-json response: {}", e)))?;

        let output = payload
            .get("output")
            .cloned()
            .ok_or_else(|| CoreError::LlmSchemaInvalid("missing output field".to_string()))?;

        let usage = payload.get("usage");
        let input_tokens_est = usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| (req.system.len() + req.user.len()) as u64 / 4)
            as u32;
        let output_tokens_est = usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| output.to_string().len() as u64 / 4)
            as u32;

        Ok(LlmRaw { json: output, input_tokens_est, output_tokens_est })
    }

    fn model_version(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Scripted provider (test double)
// ---------------------------------------------------------------------------

/// Failure kinds a scripted provider can replay.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedFailure {
    Transient,
    Timeout,
    Refused,
}

/// Deterministic provider used by tests: pops scripted responses in
/// order and counts calls so tests can assert "no LLM call happened".
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<Value, ScriptedFailure>>>,
    calls: AtomicU32,
    model: String,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            model: "scripted-model".to_string(),
        }
    }

    pub fn push_ok(&self, value: Value) {
        self.responses.lock().push_back(Ok(value));
    }

    pub fn push_failure(&self, failure: ScriptedFailure) {
        self.responses.lock().push_back(Err(failure));
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, _req: &LlmRequest) -> Result<LlmRaw, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().pop_front();
        match next {
            Some(Ok(json)) => Ok(LlmRaw { json, input_tokens_est: 100, output_tokens_est: 50 }),
            Some(Err(ScriptedFailure::Transient)) => {
                Err(CoreError::LlmTransient("scripted".to_string()))
            }
            Some(Err(ScriptedFailure::Timeout)) => Err(CoreError::LlmTimeout(1000)),
            Some(Err(ScriptedFailure::Refused)) => Err(CoreError::LlmRefused),
            None => Err(CoreError::LlmTransient("script exhausted".to_string())),
        }
    }

    fn model_version(&self) -> &str {
        &self.model
    }
}
