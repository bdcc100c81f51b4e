//! Platform lookup and name canonicalization

use sqlx::{Executor, Postgres};

/// A publishing target registered in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Platform {
    pub id: i64,
    pub name: String,
    pub active: bool,
}

/// Resolve platform-name aliases to their canonical form.
///
/// "x" (any case) is an alias for "twitter". Canonicalization is idempotent:
/// an already-canonical name passes through unchanged. Every platform lookup
/// and comparison must go through this first.
pub fn canonical_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    if lowered == "x" {
        "twitter".to_string()
    } else {
        lowered
    }
}

pub async fn find_by_name<'e, E>(executor: E, name: &str) -> Result<Option<Platform>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, name, active FROM platforms WHERE name = $1
        "#,
    )
    .bind(canonical_name(name))
    .fetch_optional(executor)
    .await
}

/// Fetch the platforms matching the given canonical names. Names without a
/// matching row are simply absent from the result; the caller decides whether
/// that is an error.
pub async fn find_by_names<'e, E>(
    executor: E,
    names: &[String],
) -> Result<Vec<Platform>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, name, active FROM platforms WHERE name = ANY($1) ORDER BY id
        "#,
    )
    .bind(names)
    .fetch_all(executor)
    .await
}
