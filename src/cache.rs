//! TTL cache for generated chapter content.
//!
//! One row per (user, chapter, content type). Anonymous rows use an empty
//! user id. Expired rows are deleted when read, and in bulk by
//! [`purge_expired`].

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Personalized,
    /// Translation into the given language code.
    Translated(String),
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Personalized => f.write_str("personalized"),
            ContentKind::Translated(lang) => write!(f, "translated_{}", lang),
        }
    }
}

fn user_key(user_id: Option<&str>) -> &str {
    user_id.unwrap_or("")
}

/// Cached content if present and unexpired.
pub async fn get(
    pool: &SqlitePool,
    user_id: Option<&str>,
    chapter_id: &str,
    kind: &ContentKind,
) -> Result<Option<String>> {
    let row = sqlx::query(
        "SELECT id, content, expires_at FROM cached_content WHERE user_id = ? AND chapter_id = ? AND content_type = ?",
    )
    .bind(user_key(user_id))
    .bind(chapter_id)
    .bind(kind.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let expires_at: Option<i64> = row.get("expires_at");
    if matches!(expires_at, Some(ts) if ts < Utc::now().timestamp()) {
        let id: String = row.get("id");
        sqlx::query("DELETE FROM cached_content WHERE id = ?")
            .bind(&id)
            .execute(pool)
            .await?;
        tracing::debug!(chapter = chapter_id, kind = %kind, "expired cache entry removed");
        return Ok(None);
    }

    Ok(Some(row.get("content")))
}

/// Store `content`, replacing any row with the same key.
pub async fn put(
    pool: &SqlitePool,
    user_id: Option<&str>,
    chapter_id: &str,
    kind: &ContentKind,
    content: &str,
    ttl_days: i64,
) -> Result<()> {
    let now = Utc::now();
    let expires_at = (now + Duration::days(ttl_days)).timestamp();

    sqlx::query(
        r#"
        INSERT INTO cached_content (id, user_id, chapter_id, content_type, content, created_at, expires_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, chapter_id, content_type) DO UPDATE SET
            content = excluded.content,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(user_key(user_id))
    .bind(chapter_id)
    .bind(kind.to_string())
    .bind(content)
    .bind(now.timestamp())
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete every expired row. Returns the number removed.
pub async fn purge_expired(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM cached_content WHERE expires_at IS NOT NULL AND expires_at < ?",
    )
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
