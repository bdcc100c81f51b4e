use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::routes::ApiKey;
use crate::services::publish::{BatchResult, JobOutcome, PublishError, PublishRequest};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/publish", post(publish_all))
        .route("/publish/{platform}", post(publish_one))
}

/// POST /publish - fan a post out to every requested platform.
///
/// The response is sent once the job's receive loop has settled; 202 signals
/// that the outcome was relayed over the webhook, not that every platform
/// succeeded.
async fn publish_all(
    State(state): State<Arc<AppState>>,
    _auth: ApiKey,
    Json(request): Json<PublishRequest>,
) -> Response {
    match state.publisher.publish_all(request).await {
        Ok(result) => {
            let (status, body) = batch_response(&result);
            (status, Json(body)).into_response()
        }
        Err(err) => error_response(err),
    }
}

fn batch_response(result: &BatchResult) -> (StatusCode, serde_json::Value) {
    match result.outcome {
        JobOutcome::Completed => (
            StatusCode::ACCEPTED,
            json!({ "message": "post published", "post_id": result.post_id }),
        ),
        JobOutcome::TimedOut => (
            StatusCode::ACCEPTED,
            json!({
                "message": "post submitted; timed out waiting for all platforms",
                "post_id": result.post_id
            }),
        ),
        // The job may still finish upstream; the synthesized summary
        // already went out over the webhook
        JobOutcome::ChannelLost => (
            StatusCode::BAD_GATEWAY,
            json!({
                "error": "connection to the publisher was lost mid-job",
                "post_id": result.post_id
            }),
        ),
    }
}

/// POST /publish/{platform} - synchronous single-platform publish. The
/// upstream status and body are passed through to the caller.
async fn publish_one(
    State(state): State<Arc<AppState>>,
    _auth: ApiKey,
    Path(platform): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Response {
    match state.publisher.publish_one(&platform, request).await {
        Ok(result) => {
            let status = StatusCode::from_u16(result.upstream.status)
                .unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(result.upstream.body)).into_response()
        }
        Err(err) => error_response(err),
    }
}

fn error_response(err: PublishError) -> Response {
    let status = match &err {
        PublishError::Validation(_) | PublishError::Image(_) => StatusCode::BAD_REQUEST,
        PublishError::UnknownPlatform(_) => StatusCode::NOT_FOUND,
        PublishError::Channel(_) | PublishError::Gateway(_) => StatusCode::BAD_GATEWAY,
        PublishError::Credential(_) | PublishError::Persistence(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!("publish failed: {}", err);
    } else {
        tracing::warn!("publish rejected: {}", err);
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
