//! Single-shot retrieval-augmented answering.
//!
//! Embeds the question, pulls the nearest book passages, and asks the model
//! once with those passages numbered in the system prompt. Backs the legacy
//! query endpoint and `tutor ask --legacy`.

use anyhow::Result;
use serde::Serialize;

use crate::context::AppContext;
use crate::embedding::embed_query;
use crate::llm::{CompletionRequest, Message};
use crate::models::{truncate_chars, Citation, UserProfile};

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant for an educational book about AI development.

Answer questions based on the following context from the book. If the answer isn't in the context, say \"I don't have information about that in the book.\"

When citing information, reference the source numbers in brackets like [1], [2], etc.

Context:
";

#[derive(Debug, Clone, Default)]
pub struct RagRequest {
    pub query: String,
    pub selected_text: Option<String>,
    pub chapter_id: Option<String>,
    pub profile: Option<UserProfile>,
    /// Passages to retrieve; `None` uses `vector_store.top_k`.
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// The text that gets embedded: the question alone, or the question framed
/// by the reader's selection.
pub fn full_query(query: &str, selected_text: Option<&str>, selected_chars: usize) -> String {
    match selected_text.filter(|s| !s.trim().is_empty()) {
        Some(selected) => format!(
            "Regarding this text: '{}'\n\nQuestion: {}",
            truncate_chars(selected, selected_chars),
            query
        ),
        None => query.to_string(),
    }
}

pub fn build_system_prompt(context: &str, profile: Option<&UserProfile>) -> String {
    let mut prompt = format!("{}{}\n", SYSTEM_PROMPT, context);
    if let Some(profile) = profile {
        prompt.push_str(&format!(
            "\n\nAdjust your explanation for a {} learner.",
            profile.experience_level
        ));
        if !profile.known_languages.is_empty() {
            prompt.push_str(&format!(
                " They are familiar with: {}.",
                profile.known_languages.join(", ")
            ));
        }
    }
    prompt
}

pub async fn query(ctx: &AppContext, req: RagRequest) -> Result<RagAnswer> {
    let full = full_query(
        &req.query,
        req.selected_text.as_deref(),
        ctx.config.agent.selected_text_chars,
    );
    let vector = embed_query(ctx.embedder.as_ref(), &full).await?;

    let top_k = req.top_k.unwrap_or(ctx.config.vector_store.top_k).max(1);
    let hits = ctx
        .vectors
        .search(&vector, top_k, req.chapter_id.as_deref())
        .await?;

    let mut context_parts = Vec::with_capacity(hits.len());
    let mut citations = Vec::with_capacity(hits.len());
    for (i, hit) in hits.iter().enumerate() {
        context_parts.push(format!("[{}] {}", i + 1, hit.text()));
        citations.push(Citation {
            id: i + 1,
            source: hit.source().to_string(),
            chapter: hit.chapter_id().to_string(),
            score: hit.score,
        });
    }

    let request = CompletionRequest {
        messages: vec![
            Message::system(build_system_prompt(
                &context_parts.join("\n\n"),
                req.profile.as_ref(),
            )),
            Message::user(req.query.clone()),
        ],
        tools: Vec::new(),
        temperature: Some(ctx.config.llm.temperature),
        max_tokens: Some(ctx.config.llm.max_tokens),
    };

    let completion = ctx.llm.complete(&request).await?;
    tracing::debug!(
        passages = citations.len(),
        model = %completion.model,
        "rag answer generated"
    );

    Ok(RagAnswer {
        answer: completion.into_text()?,
        citations,
    })
}
