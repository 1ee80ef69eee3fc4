//! Learner profiles.
//!
//! Users are created lazily the first time an identity is seen; a profile row
//! is created with defaults on the first update.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::models::{ExperienceLevel, HardwareTier, ProfileUpdate, UserProfile};

/// Insert the user row if it does not exist yet. Accepts a pool or an open
/// transaction.
pub async fn ensure_user<'e, E>(executor: E, user_id: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let now = Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO users (id, created_at, updated_at) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING",
    )
    .bind(user_id)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await
    .with_context(|| format!("failed to create user {}", user_id))?;
    Ok(())
}

fn parse_list(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

pub async fn get_profile(pool: &SqlitePool, user_id: &str) -> Result<Option<UserProfile>> {
    let row = sqlx::query(
        "SELECT experience_level, known_languages, hardware_tier, goals FROM user_profiles WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let level: String = row.get("experience_level");
        let languages: String = row.get("known_languages");
        let tier: String = row.get("hardware_tier");
        let goals: String = row.get("goals");
        UserProfile {
            user_id: user_id.to_string(),
            experience_level: ExperienceLevel::parse_lenient(&level),
            known_languages: parse_list(&languages),
            hardware_tier: HardwareTier::parse_lenient(&tier),
            goals: parse_list(&goals),
        }
    }))
}

/// Merge `update` into the stored profile and return the result.
pub async fn update_profile(
    pool: &SqlitePool,
    user_id: &str,
    update: ProfileUpdate,
) -> Result<UserProfile> {
    ensure_user(pool, user_id).await?;

    let current = get_profile(pool, user_id).await?.unwrap_or_else(|| UserProfile {
        user_id: user_id.to_string(),
        ..Default::default()
    });

    let merged = UserProfile {
        user_id: user_id.to_string(),
        experience_level: update
            .experience_level
            .unwrap_or(current.experience_level),
        known_languages: update.known_languages.unwrap_or(current.known_languages),
        hardware_tier: update.hardware_tier.unwrap_or(current.hardware_tier),
        goals: update.goals.unwrap_or(current.goals),
    };

    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO user_profiles (id, user_id, experience_level, known_languages, hardware_tier, goals, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            experience_level = excluded.experience_level,
            known_languages = excluded.known_languages,
            hardware_tier = excluded.hardware_tier,
            goals = excluded.goals,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(merged.experience_level.as_str())
    .bind(serde_json::to_string(&merged.known_languages)?)
    .bind(merged.hardware_tier.as_str())
    .bind(serde_json::to_string(&merged.goals)?)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::debug!(user = user_id, level = %merged.experience_level, "profile updated");
    Ok(merged)
}
