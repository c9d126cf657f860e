use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashSet, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashSet<String>>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("API_KEYS")
            .or_else(|_| env::var("API_KEY"))
            .unwrap_or_default();
        let keys = parse_keys(&raw);
        if keys.is_empty() {
            warn!(
                target = "research.api",
                "no API_KEYS configured; every /api request will be rejected"
            );
        } else {
            info!(target = "research.api", key_count = keys.len(), "loaded API keys from env");
        }
        Self {
            keys: Arc::new(keys),
        }
    }

    fn authenticate(&self, presented: &str) -> bool {
        self.keys.contains(presented)
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-API-Key or Bearer token",
        ));
    };

    if !state.authenticate(&presented) {
        warn!(target = "research.api", path = %request.uri().path(), "rejected api key");
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    }

    Ok(next.run(request).await)
}

fn parse_keys(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-API-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}
