use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;
use crate::domain::{posts, sends};
use crate::routes::ApiKey;
use crate::services::error::LogErr;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/history", get(list_history))
        .route("/history/{id}", get(history_detail))
}

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Deserialize)]
struct HistoryParams {
    page: Option<i64>,
    size: Option<i64>,
}

#[derive(Serialize)]
struct HistoryPage {
    items: Vec<posts::HistoryItem>,
    page: i64,
    size: i64,
    total: i64,
}

/// GET /history?page=&size= - posts newest-first with their send outcomes.
async fn list_history(
    State(state): State<Arc<AppState>>,
    _auth: ApiKey,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, StatusCode> {
    let page = params.page.unwrap_or(1).max(1);
    let size = params
        .size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1) * size;

    let (items, total) = posts::list_history_paginated(&state.db, size, offset)
        .await
        .log_500("history query failed")?;

    Ok(Json(HistoryPage {
        items,
        page,
        size,
        total,
    }))
}

#[derive(Serialize)]
struct HistoryDetail {
    #[serde(flatten)]
    item: posts::HistoryItem,
    tags: Vec<String>,
    images: Vec<posts::PostImage>,
}

/// GET /history/{id} - one post with tags, images and sends.
async fn history_detail(
    State(state): State<Arc<AppState>>,
    _auth: ApiKey,
    Path(id): Path<i64>,
) -> Result<Json<HistoryDetail>, StatusCode> {
    let post = posts::find_post(&state.db, id)
        .await
        .log_500("post lookup failed")?
        .ok_or(StatusCode::NOT_FOUND)?;

    let send_rows = sends::list_for_post(&state.db, id)
        .await
        .log_500("send lookup failed")?;
    let tags = posts::list_tags(&state.db, id)
        .await
        .log_500("tag lookup failed")?;
    let images = posts::list_images(&state.db, id)
        .await
        .log_500("image lookup failed")?;

    Ok(Json(HistoryDetail {
        item: posts::HistoryItem {
            id: post.id,
            text: post.text,
            status: post.status,
            publish_at: post.publish_at,
            created_at: post.created_at,
            sends: send_rows,
        },
        tags,
        images,
    }))
}
