pub mod history;
pub mod publish;

use axum::{
    Router,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    routing::get,
};
use std::sync::Arc;

use crate::AppState;

/// Build all routes for the API
pub fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .merge(publish::routes())
        .merge(history::routes())
}

async fn health() -> &'static str {
    "ok"
}

/// Extractor that enforces the shared API key. Routes that include it reject
/// requests whose X-API-KEY header does not match; when no key is configured
/// the check is skipped (local development).
pub struct ApiKey;

impl FromRequestParts<Arc<AppState>> for ApiKey {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.api_key.as_deref() else {
            return Ok(ApiKey);
        };

        let given = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());

        if given == Some(expected) {
            Ok(ApiKey)
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
