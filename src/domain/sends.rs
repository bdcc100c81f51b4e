//! The send ledger: one row per (post, platform) pair, created when a job is
//! submitted and updated as the synchronizer reports per-platform outcomes.
//!
//! `success` is tri-state: NULL until a terminal progress event arrives, then
//! true/false. Rows are never deleted during a publish attempt, only updated;
//! a later terminal event for the same platform overwrites the earlier one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, PgPool, Postgres};

use super::platforms::canonical_name;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SendView {
    pub post_id: i64,
    pub platform: String,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Read/update contract the publish coordinator needs from the storage
/// layer. Implemented against Postgres below; tests substitute an in-memory
/// fake.
#[async_trait]
pub trait SendLedger: Send + Sync {
    async fn find(&self, post_id: i64, platform: &str) -> Result<Option<SendView>, sqlx::Error>;

    /// Single-row read-modify-write of one send's terminal outcome.
    async fn update(
        &self,
        post_id: i64,
        platform: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error>;

    /// Platforms among `names` whose send for this post is marked successful.
    async fn successful_among(
        &self,
        post_id: i64,
        names: &[String],
    ) -> Result<Vec<String>, sqlx::Error>;
}

pub async fn create_send<'e, E>(
    executor: E,
    post_id: i64,
    platform_id: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO sends (post_id, platform_id) VALUES ($1, $2)
        "#,
    )
    .bind(post_id)
    .bind(platform_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_for_post<'e, E>(executor: E, post_id: i64) -> Result<Vec<SendView>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT s.post_id, p.name AS platform, s.success, s.error, s.updated_at
        FROM sends s
        JOIN platforms p ON p.id = s.platform_id
        WHERE s.post_id = $1
        ORDER BY s.id
        "#,
    )
    .bind(post_id)
    .fetch_all(executor)
    .await
}

#[derive(Clone)]
pub struct PgSendLedger {
    pool: PgPool,
}

impl PgSendLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SendLedger for PgSendLedger {
    async fn find(&self, post_id: i64, platform: &str) -> Result<Option<SendView>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT s.post_id, p.name AS platform, s.success, s.error, s.updated_at
            FROM sends s
            JOIN platforms p ON p.id = s.platform_id
            WHERE s.post_id = $1 AND p.name = $2
            "#,
        )
        .bind(post_id)
        .bind(canonical_name(platform))
        .fetch_optional(&self.pool)
        .await
    }

    async fn update(
        &self,
        post_id: i64,
        platform: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE sends SET success = $3, error = $4, updated_at = NOW()
            WHERE post_id = $1
              AND platform_id = (SELECT id FROM platforms WHERE name = $2)
            "#,
        )
        .bind(post_id)
        .bind(canonical_name(platform))
        .bind(success)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn successful_among(
        &self,
        post_id: i64,
        names: &[String],
    ) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT p.name
            FROM sends s
            JOIN platforms p ON p.id = s.platform_id
            WHERE s.post_id = $1 AND s.success = TRUE AND p.name = ANY($2)
            "#,
        )
        .bind(post_id)
        .bind(names)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}
