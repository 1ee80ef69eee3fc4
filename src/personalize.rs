//! Chapter content rewritten for a learner's profile.

use anyhow::Result;

use crate::book::is_valid_chapter_id;
use crate::cache::{self, ContentKind};
use crate::context::AppContext;
use crate::error::ApiError;
use crate::llm::{CompletionRequest, Message};
use crate::models::{GeneratedContent, UserProfile};
use crate::profile;

const SYSTEM_PROMPT: &str = "You are an expert educational content adapter.
Your task is to personalize educational content based on the learner's profile.

Rules:
- Keep all code blocks unchanged
- Maintain the original structure (headings, sections)
- Adjust explanations for the learner's level
- Use relevant examples based on their known languages
- Keep the content length similar to the original
";

pub fn build_prompt(content: &str, profile: &UserProfile) -> String {
    let languages = if profile.known_languages.is_empty() {
        "None specified".to_string()
    } else {
        profile.known_languages.join(", ")
    };
    let goals = if profile.goals.is_empty() {
        "General learning".to_string()
    } else {
        profile.goals.join(", ")
    };

    format!(
        "Personalize the following educational content for a learner with this profile:

- Experience Level: {level}
- Programming Languages Known: {languages}
- Hardware: {hardware} tier
- Learning Goals: {goals}

Instructions:
1. For beginners: Add more context, simpler explanations, more analogies
2. For intermediate: Balance theory and practice
3. For advanced: Focus on nuances, edge cases, and advanced patterns

If they know specific languages, use comparisons to those languages where helpful.

Original Content:
{content}

Personalized Content:",
        level = profile.experience_level,
        hardware = profile.hardware_tier,
    )
}

/// Personalized text of `chapter_id` for `user_id`.
///
/// Anonymous callers are rejected as unauthorized, and users without a
/// profile as a bad request.
pub async fn personalize(
    ctx: &AppContext,
    user_id: Option<&str>,
    chapter_id: &str,
) -> Result<GeneratedContent> {
    let user_id = user_id.ok_or_else(|| {
        ApiError::Unauthorized("Authentication required for personalization".into())
    })?;
    if !is_valid_chapter_id(chapter_id) {
        return Err(ApiError::BadRequest(format!("invalid chapter id: {}", chapter_id)).into());
    }
    let profile = profile::get_profile(&ctx.pool, user_id)
        .await?
        .ok_or_else(|| ApiError::BadRequest("Please complete your profile first".into()))?;

    let kind = ContentKind::Personalized;
    if let Some(content) = cache::get(&ctx.pool, Some(user_id), chapter_id, &kind).await? {
        return Ok(GeneratedContent {
            content,
            cached: true,
        });
    }

    let original = ctx.catalog.chapter_content(chapter_id).await?;
    let request = CompletionRequest {
        messages: vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(build_prompt(&original, &profile)),
        ],
        tools: Vec::new(),
        temperature: Some(ctx.config.llm.temperature),
        max_tokens: Some(ctx.config.llm.max_tokens),
    };
    let content = ctx.llm.complete(&request).await?.into_text()?;

    cache::put(
        &ctx.pool,
        Some(user_id),
        chapter_id,
        &kind,
        &content,
        ctx.config.cache.personalized_ttl_days,
    )
    .await?;
    tracing::info!(user = user_id, chapter = chapter_id, "personalized content generated");

    Ok(GeneratedContent {
        content,
        cached: false,
    })
}
