//! Tools the book assistant can call.
//!
//! Each tool implements [`Tool`] and is registered in a [`ToolRegistry`].
//! The registry advertises every tool to the model in OpenAI
//! function-calling format, and the agent loop dispatches the model's tool
//! calls back through it.
//!
//! | Tool | Purpose |
//! |------|---------|
//! | `search_book` | Semantic search over indexed book passages |
//! | `get_chapter_content` | Chapter overview, optionally with objectives |
//! | `list_chapters` | Chapter catalog |
//! | `explain_concept` | Level-adapted explanation scaffold plus search hits |
//! | `get_learning_path` | Ordered chapter recommendations plus search hits |

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::book::Catalog;
use crate::context::AppContext;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::models::{truncate_chars, ExperienceLevel};
use crate::vector_store::VectorStore;

/// Characters of each passage shown in search output.
const EXCERPT_CHARS: usize = 500;
const MAX_CONTEXT_WINDOW: usize = 20;

pub const NO_RESULTS: &str = "No relevant content found in the book for this query.";

#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name exposed to the model (lowercase with underscores).
    fn name(&self) -> &str;

    /// One-line description the model uses to decide whether to call it.
    fn description(&self) -> &str;

    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. The returned text is handed back to the model verbatim.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String>;
}

/// Backends available to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub vectors: Arc<dyn VectorStore>,
    pub catalog: Arc<Catalog>,
}

impl ToolContext {
    pub fn from_app(ctx: &AppContext) -> Self {
        Self {
            embedder: ctx.embedder.clone(),
            vectors: ctx.vectors.clone(),
            catalog: ctx.catalog.clone(),
        }
    }

    /// Semantic search rendered as numbered excerpts.
    pub async fn search_book(
        &self,
        query: &str,
        chapter_filter: Option<&str>,
        context_window: usize,
    ) -> Result<String> {
        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let hits = self
            .vectors
            .search(
                &vector,
                context_window.clamp(1, MAX_CONTEXT_WINDOW),
                chapter_filter,
            )
            .await?;

        if hits.is_empty() {
            return Ok(NO_RESULTS.to_string());
        }

        let formatted: Vec<String> = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| {
                let text = hit.text();
                let excerpt = truncate_chars(text, EXCERPT_CHARS);
                let ellipsis = if excerpt.len() < text.len() { "..." } else { "" };
                format!(
                    "[{}] (Chapter: {}, Page: {}, Relevance: {:.2})\n{}{}",
                    i + 1,
                    hit.chapter_id(),
                    hit.page_number(),
                    hit.score,
                    excerpt,
                    ellipsis
                )
            })
            .collect();

        Ok(formatted.join("\n\n---\n\n"))
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    let value = params[key].as_str().unwrap_or("").trim();
    if value.is_empty() {
        bail!("{} must not be empty", key);
    }
    Ok(value)
}

fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params[key].as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn level_param(params: &Value) -> ExperienceLevel {
    optional_str(params, "experience_level")
        .map(ExperienceLevel::parse_lenient)
        .unwrap_or_default()
}

const LEVEL_ENUM: [&str; 3] = ["beginner", "intermediate", "advanced"];

// ============ search_book ============

pub struct SearchBookTool;

#[async_trait]
impl Tool for SearchBookTool {
    fn name(&self) -> &str {
        "search_book"
    }

    fn description(&self) -> &str {
        "Search the book content using semantic search. Returns relevant excerpts with chapter and relevance."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query to find relevant content in the book" },
                "chapter_filter": { "type": "string", "description": "Optional chapter ID to limit search (e.g. \"chapter-1\")" },
                "context_window": { "type": "integer", "description": "Number of results to return", "default": 5 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let query = required_str(&params, "query")?;
        let window = params["context_window"].as_u64().unwrap_or(5) as usize;
        ctx.search_book(query, optional_str(&params, "chapter_filter"), window)
            .await
    }
}

// ============ get_chapter_content ============

pub struct ChapterContentTool;

#[async_trait]
impl Tool for ChapterContentTool {
    fn name(&self) -> &str {
        "get_chapter_content"
    }

    fn description(&self) -> &str {
        "Get the overview of a specific chapter, optionally with its learning objectives."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chapter_id": { "type": "string", "description": "The chapter identifier (e.g. \"chapter-1\")" },
                "include_context": { "type": "boolean", "description": "Include learning objectives", "default": true }
            },
            "required": ["chapter_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let chapter_id = required_str(&params, "chapter_id")?;
        let include_context = params["include_context"].as_bool().unwrap_or(true);
        ctx.catalog.chapter_overview(chapter_id, include_context).await
    }
}

// ============ list_chapters ============

pub struct ListChaptersTool;

#[async_trait]
impl Tool for ListChaptersTool {
    fn name(&self) -> &str {
        "list_chapters"
    }

    fn description(&self) -> &str {
        "List all available chapters in the book with their topics."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<String> {
        Ok(ctx.catalog.render_list())
    }
}

// ============ explain_concept ============

pub struct ExplainConceptTool;

struct LevelGuide {
    instructions: &'static str,
    depth: &'static str,
    examples: &'static str,
}

fn level_guide(level: ExperienceLevel) -> LevelGuide {
    match level {
        ExperienceLevel::Beginner => LevelGuide {
            instructions: "Explain in simple terms with analogies. Avoid jargon.",
            depth: "surface level with intuitive understanding",
            examples: "simple, everyday analogies",
        },
        ExperienceLevel::Intermediate => LevelGuide {
            instructions: "Balance theory and practice. Include some technical details.",
            depth: "moderate depth with practical applications",
            examples: "technical examples with some complexity",
        },
        ExperienceLevel::Advanced => LevelGuide {
            instructions: "Focus on nuances, edge cases, and advanced patterns.",
            depth: "deep dive with implementation details",
            examples: "complex, production-level examples",
        },
    }
}

#[async_trait]
impl Tool for ExplainConceptTool {
    fn name(&self) -> &str {
        "explain_concept"
    }

    fn description(&self) -> &str {
        "Explain a concept adapted to the learner's experience level, grounded in book content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "concept": { "type": "string", "description": "The AI/ML concept to explain" },
                "experience_level": { "type": "string", "enum": LEVEL_ENUM, "default": "beginner" },
                "include_examples": { "type": "boolean", "default": true }
            },
            "required": ["concept"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let concept = required_str(&params, "concept")?;
        let level = level_param(&params);
        let include_examples = params["include_examples"].as_bool().unwrap_or(true);
        let guide = level_guide(level);

        let search_results = ctx.search_book(concept, None, 5).await?;

        let mut out = format!("Explanation for '{}' at {} level:\n\n", concept, level);
        out.push_str(&format!("Guidelines: {}\n", guide.instructions));
        out.push_str(&format!("Depth: {}\n", guide.depth));
        if include_examples {
            out.push_str(&format!("Example Type: {}\n\n", guide.examples));
        }
        out.push_str(&format!("Relevant book content:\n{}", search_results));
        Ok(out)
    }
}

// ============ get_learning_path ============

pub struct LearningPathTool;

#[async_trait]
impl Tool for LearningPathTool {
    fn name(&self) -> &str {
        "get_learning_path"
    }

    fn description(&self) -> &str {
        "Build a personalized learning path for a topic based on experience level."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "topic": { "type": "string", "description": "The topic to plan a path for" },
                "experience_level": { "type": "string", "enum": LEVEL_ENUM, "default": "beginner" }
            },
            "required": ["topic"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let topic = required_str(&params, "topic")?;
        let level = level_param(&params);

        let search_results = ctx.search_book(topic, None, 5).await?;

        let mut out = format!(
            "Personalized Learning Path for '{}' at {} level:\n\n",
            topic, level
        );
        for (i, step) in ctx.catalog.learning_path(level).iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        out.push_str(&format!("\nRelevant content found:\n{}", search_results));
        Ok(out)
    }
}

// ============ Registry ============

/// Ordered set of tools available to the assistant.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with every built-in book tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SearchBookTool));
        registry.register(Box::new(ChapterContentTool));
        registry.register(Box::new(ListChaptersTool));
        registry.register(Box::new(ExplainConceptTool));
        registry.register(Box::new(LearningPathTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// Tool specs in OpenAI `tools` request format.
    pub fn specs(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters_schema(),
                    }
                })
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
