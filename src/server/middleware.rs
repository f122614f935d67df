//! Authentication and error mapping for the HTTP surface.
//!
//! `Origin` is never authentication; CORS is a separate whitelist.
//! Caller endpoints fail closed in production when no caller key is
//! configured. Admin endpoints always fail closed.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use super::client_ip::bearer_token;
use crate::config::RunEnv;
use crate::error::CoreError;
use crate::state::ServiceState;

/// Wire shape for every error the API returns. No raw internals.
pub struct ApiError(pub CoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = serde_json::json!({
            "error": self.0.code(),
            "message": self.0.public_message(),
        });
        if let CoreError::RateLimited { retry_after_secs, limit } = &self.0 {
            body["retry_after"] = serde_json::json!(retry_after_secs);
            body["limit"] = serde_json::json!(limit);
        }

        let mut response = (status, Json(body)).into_response();
        if let CoreError::RateLimited { retry_after_secs, .. } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "unauthorized", "message": message})),
    )
        .into_response()
}

fn is_admin_path(path: &str) -> bool {
    path.starts_with("/features/") || path == "/rules"
}

pub async fn auth_middleware(
    State(state): State<Arc<ServiceState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if path == "/health" {
        return next.run(request).await;
    }

    let bearer = bearer_token(request.headers()).map(str::to_string);

    if is_admin_path(&path) {
        // Admin bearer only. Unset key means nobody gets in.
        match (&state.secrets.admin_key, bearer.as_deref()) {
            (Some(expected), Some(given)) if expected == given => {}
            _ => return unauthorized("admin bearer required"),
        }
        return next.run(request).await;
    }

    let admin_ok = match (&state.secrets.admin_key, bearer.as_deref()) {
        (Some(expected), Some(given)) => expected == given,
        _ => false,
    };
    let caller_ok = match &state.secrets.caller_key {
        Some(expected) => bearer.as_deref() == Some(expected.as_str()),
        // No caller key configured: development convenience only.
        None => state.secrets.env != RunEnv::Production,
    };
    if !caller_ok && !admin_ok {
        return unauthorized("caller token required");
    }

    next.run(request).await
}
