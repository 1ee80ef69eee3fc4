//! Chapter translation (Urdu) with code blocks kept verbatim.
//!
//! Fenced code blocks are swapped for `__CODE_BLOCK_<i>__` placeholders
//! before the text goes to the model, then swapped back into the reply.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;

use crate::book::is_valid_chapter_id;
use crate::cache::{self, ContentKind};
use crate::context::AppContext;
use crate::error::ApiError;
use crate::llm::{CompletionRequest, Message};
use crate::models::GeneratedContent;

pub const SUPPORTED_LANGUAGES: &[&str] = &["ur"];

const TEMPERATURE: f32 = 0.3;

const SYSTEM_PROMPT: &str = "You are an expert translator specializing in technical content translation to Urdu.

Rules:
1. Translate all text content to Urdu
2. Keep technical terms in English with Urdu explanation if needed
3. Preserve all placeholders like __CODE_BLOCK_0__
4. Maintain markdown formatting (headings, lists, bold, etc.)
5. Keep the document structure intact
6. Translate naturally, not word-by-word
";

static CODE_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```").ok());

fn placeholder(i: usize) -> String {
    format!("__CODE_BLOCK_{}__", i)
}

/// Replace fenced code blocks with placeholders. Returns the protected text
/// and the blocks in order.
pub fn protect_code_blocks(content: &str) -> (String, Vec<String>) {
    let mut blocks = Vec::new();
    let Some(re) = CODE_BLOCK.as_ref() else {
        return (content.to_string(), blocks);
    };
    let protected = re.replace_all(content, |caps: &regex::Captures| {
        let i = blocks.len();
        blocks.push(caps[0].to_string());
        placeholder(i)
    });
    (protected.into_owned(), blocks)
}

pub fn restore_code_blocks(text: &str, blocks: &[String]) -> String {
    let mut out = text.to_string();
    for (i, block) in blocks.iter().enumerate() {
        out = out.replace(&placeholder(i), block);
    }
    out
}

/// Translate `chapter_id` into `target_language`.
///
/// The cache is only consulted and written for identified users.
pub async fn translate(
    ctx: &AppContext,
    user_id: Option<&str>,
    chapter_id: &str,
    target_language: &str,
) -> Result<GeneratedContent> {
    if !SUPPORTED_LANGUAGES.contains(&target_language) {
        return Err(ApiError::BadRequest(
            "Only Urdu (ur) translation is currently supported".into(),
        )
        .into());
    }
    if !is_valid_chapter_id(chapter_id) {
        return Err(ApiError::BadRequest(format!("invalid chapter id: {}", chapter_id)).into());
    }

    let kind = ContentKind::Translated(target_language.to_string());
    if let Some(user) = user_id {
        if let Some(content) = cache::get(&ctx.pool, Some(user), chapter_id, &kind).await? {
            return Ok(GeneratedContent {
                content,
                cached: true,
            });
        }
    }

    let original = ctx.catalog.chapter_content(chapter_id).await?;
    let (protected, blocks) = protect_code_blocks(&original);

    let request = CompletionRequest {
        messages: vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(format!("Translate this content to Urdu:\n\n{}", protected)),
        ],
        tools: Vec::new(),
        temperature: Some(TEMPERATURE),
        max_tokens: Some(ctx.config.llm.max_tokens),
    };
    let translated = ctx.llm.complete(&request).await?.into_text()?;
    let content = restore_code_blocks(&translated, &blocks);

    if let Some(user) = user_id {
        cache::put(
            &ctx.pool,
            Some(user),
            chapter_id,
            &kind,
            &content,
            ctx.config.cache.translated_ttl_days,
        )
        .await?;
    }
    tracing::info!(
        chapter = chapter_id,
        lang = target_language,
        code_blocks = blocks.len(),
        "chapter translated"
    );

    Ok(GeneratedContent {
        content,
        cached: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;
    use tempfile::TempDir;

    const DOC: &str = "# Title\n\nIntro.\n\n```python\nprint('hi')\n```\n\nMiddle.\n\n```\nls -la\n```\n";

    #[test]
    fn test_protect_and_restore() {
        let (protected, blocks) = protect_code_blocks(DOC);
        assert_eq!(blocks.len(), 2);
        assert!(protected.contains("__CODE_BLOCK_0__"));
        assert!(protected.contains("__CODE_BLOCK_1__"));
        assert!(!protected.contains("print('hi')"));
        assert_eq!(restore_code_blocks(&protected, &blocks), DOC);
    }

    #[test]
    fn test_no_code_blocks() {
        let (protected, blocks) = protect_code_blocks("plain text");
        assert_eq!(protected, "plain text");
        assert!(blocks.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let tmp = TempDir::new().unwrap();
        let t = test_context(&tmp.path().join("t.sqlite"), None).await.unwrap();
        let err = translate(&t.ctx, None, "chapter-1", "fr").await.unwrap_err();
        assert_eq!(ApiError::from_anyhow(err).code(), "bad_request");
    }

    #[tokio::test]
    async fn test_code_blocks_survive_translation() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(docs.join("chapter-3")).unwrap();
        std::fs::write(docs.join("chapter-3").join("overview.mdx"), DOC).unwrap();
        let t = test_context(&tmp.path().join("t.sqlite"), Some(&docs))
            .await
            .unwrap();
        t.model
            .push_text("# عنوان\n\n__CODE_BLOCK_0__\n\n__CODE_BLOCK_1__");

        let out = translate(&t.ctx, None, "chapter-3", "ur").await.unwrap();
        assert!(out.content.contains("```python\nprint('hi')\n```"));
        assert!(out.content.contains("```\nls -la\n```"));
        assert!(!out.cached);

        let request = &t.model.requests()[0];
        assert_eq!(request.temperature, Some(0.3));
        match &request.messages[1] {
            Message::User { content } => assert!(!content.contains("print('hi')")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cache_only_for_known_user() {
        let tmp = TempDir::new().unwrap();
        let t = test_context(&tmp.path().join("t.sqlite"), None).await.unwrap();

        translate(&t.ctx, None, "chapter-1", "ur").await.unwrap();
        translate(&t.ctx, None, "chapter-1", "ur").await.unwrap();
        assert_eq!(t.model.requests().len(), 2);

        let first = translate(&t.ctx, Some("u1"), "chapter-1", "ur").await.unwrap();
        assert!(!first.cached);
        let second = translate(&t.ctx, Some("u1"), "chapter-1", "ur").await.unwrap();
        assert!(second.cached);
        assert_eq!(t.model.requests().len(), 3);
    }
}
