//! Post persistence: the post row itself, its tags and images, and the
//! paginated history readback.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, PgPool, Postgres};
use std::collections::HashMap;

use super::sends::SendView;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PostRecord {
    pub id: i64,
    pub text: Option<String>,
    pub status: String,
    pub publish_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// An image attached to a post: either an already-hosted URL or a base64
/// data URI, optionally restricted to a subset of platforms.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PostImage {
    pub url: String,
    pub platforms: Option<sqlx::types::Json<Vec<String>>>,
}

pub async fn create_post<'e, E>(
    executor: E,
    text: Option<&str>,
    platform_options: Option<&serde_json::Value>,
    callback_url: Option<&str>,
    publish_at: Option<DateTime<Utc>>,
) -> Result<PostRecord, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        INSERT INTO posts (text, platform_options, callback_url, publish_at)
        VALUES ($1, $2, $3, COALESCE($4, NOW()))
        RETURNING id, text, status, publish_at, created_at
        "#,
    )
    .bind(text)
    .bind(platform_options)
    .bind(callback_url)
    .bind(publish_at)
    .fetch_one(executor)
    .await
}

/// Upsert one tag and link it to the post.
pub async fn attach_tag<'e, E>(executor: E, post_id: i64, tag: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        WITH tag_row AS (
            INSERT INTO tags (name) VALUES ($2)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
        )
        INSERT INTO post_tags (post_id, tag_id)
        SELECT $1, id FROM tag_row
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(post_id)
    .bind(tag)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn attach_image<'e, E>(
    executor: E,
    post_id: i64,
    url: &str,
    platforms: Option<&[String]>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO post_images (post_id, url, platforms)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(post_id)
    .bind(url)
    .bind(platforms.map(|p| serde_json::json!(p)))
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn find_post<'e, E>(executor: E, post_id: i64) -> Result<Option<PostRecord>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, text, status, publish_at, created_at FROM posts WHERE id = $1
        "#,
    )
    .bind(post_id)
    .fetch_optional(executor)
    .await
}

pub async fn update_status<'e, E>(
    executor: E,
    post_id: i64,
    status: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE posts SET status = $2, updated_at = NOW() WHERE id = $1
        "#,
    )
    .bind(post_id)
    .bind(status)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_tags<'e, E>(executor: E, post_id: i64) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT t.name FROM tags t
        JOIN post_tags pt ON pt.tag_id = t.id
        WHERE pt.post_id = $1
        ORDER BY t.name
        "#,
    )
    .bind(post_id)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

pub async fn list_images<'e, E>(executor: E, post_id: i64) -> Result<Vec<PostImage>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT url, platforms FROM post_images WHERE post_id = $1 ORDER BY id
        "#,
    )
    .bind(post_id)
    .fetch_all(executor)
    .await
}

// History readback

#[derive(Debug, Serialize)]
pub struct HistoryItem {
    pub id: i64,
    pub text: Option<String>,
    pub status: String,
    pub publish_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub sends: Vec<SendView>,
}

/// List posts newest-first with their send outcomes, paginated in the
/// database. Returns (items, total_count).
pub async fn list_history_paginated(
    db: &PgPool,
    limit: i64,
    offset: i64,
) -> Result<(Vec<HistoryItem>, i64), sqlx::Error> {
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
        .fetch_one(db)
        .await?;

    let posts: Vec<PostRecord> = sqlx::query_as(
        r#"
        SELECT id, text, status, publish_at, created_at
        FROM posts
        ORDER BY created_at DESC
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await?;

    let post_ids: Vec<i64> = posts.iter().map(|p| p.id).collect();

    // Batch fetch sends for the whole page instead of one query per post
    let send_rows: Vec<SendView> = sqlx::query_as(
        r#"
        SELECT s.post_id, p.name AS platform, s.success, s.error, s.updated_at
        FROM sends s
        JOIN platforms p ON p.id = s.platform_id
        WHERE s.post_id = ANY($1)
        ORDER BY s.id
        "#,
    )
    .bind(&post_ids)
    .fetch_all(db)
    .await?;

    let mut sends_by_post: HashMap<i64, Vec<SendView>> = HashMap::new();
    for send in send_rows {
        sends_by_post.entry(send.post_id).or_default().push(send);
    }

    let items = posts
        .into_iter()
        .map(|p| HistoryItem {
            sends: sends_by_post.remove(&p.id).unwrap_or_default(),
            id: p.id,
            text: p.text,
            status: p.status,
            publish_at: p.publish_at,
            created_at: p.created_at,
        })
        .collect();

    Ok((items, total))
}
