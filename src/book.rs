//! Chapter catalog and chapter text lookup.
//!
//! Chapters come from `[[book.chapters]]` in the config, or the built-in
//! six-chapter catalog when none are configured. Chapter bodies are read from
//! `<docs_dir>/<chapter-id>/overview.mdx`.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::config::BookConfig;
pub use crate::config::ChapterConfig as Chapter;
use crate::models::{truncate_chars, ExperienceLevel};

/// Characters of chapter text handed to the assistant as an overview.
const OVERVIEW_CHARS: usize = 2000;

/// Chapter ids are used as path components, so only `[a-z0-9-]` is allowed.
pub fn is_valid_chapter_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn chapter(id: &str, title: &str, description: &str, topics: &[&str], objectives: &[&str]) -> Chapter {
    Chapter {
        id: id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        key_topics: topics.iter().map(|s| s.to_string()).collect(),
        objectives: objectives.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn default_chapters() -> Vec<Chapter> {
    vec![
        chapter(
            "chapter-1",
            "AI Foundations",
            "Core concepts, history, and types of AI",
            &["AI History", "Types of AI", "Machine Learning Basics"],
            &["Understand AI history", "Learn types of AI", "Grasp ML basics"],
        ),
        chapter(
            "chapter-2",
            "LLM Fundamentals",
            "Understanding Large Language Models",
            &["Transformers", "Tokenization", "APIs"],
            &["Understand transformers", "Learn tokenization", "Explore APIs"],
        ),
        chapter(
            "chapter-3",
            "Prompt Engineering",
            "Crafting effective AI prompts",
            &["CRAFT Framework", "Few-Shot Learning", "Chain-of-Thought"],
            &[
                "Master CRAFT framework",
                "Learn few-shot prompting",
                "Understand chain-of-thought",
            ],
        ),
        chapter(
            "chapter-4",
            "RAG Systems",
            "Retrieval-Augmented Generation",
            &["Embeddings", "Vector Databases", "Retrieval Methods"],
            &[
                "Learn embeddings",
                "Understand vector databases",
                "Explore retrieval methods",
            ],
        ),
        chapter(
            "chapter-5",
            "AI Agents",
            "Building autonomous AI systems",
            &["Function Calling", "Agent Loops", "Orchestration"],
            &[
                "Learn function calling",
                "Understand agent loops",
                "Explore orchestration",
            ],
        ),
        chapter(
            "chapter-6",
            "Building AI Apps",
            "Full-stack AI development",
            &["Frontend Integration", "Backend Services", "Deployment"],
            &[
                "Full-stack development",
                "Deployment strategies",
                "Production considerations",
            ],
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct Catalog {
    chapters: Vec<Chapter>,
    docs_dir: Option<PathBuf>,
}

impl Catalog {
    pub fn new(chapters: Vec<Chapter>, docs_dir: Option<PathBuf>) -> Self {
        Self { chapters, docs_dir }
    }

    pub fn from_config(config: &BookConfig) -> Self {
        let chapters = if config.chapters.is_empty() {
            default_chapters()
        } else {
            config.chapters.clone()
        };
        Self::new(chapters, config.docs_dir.clone())
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn find(&self, id: &str) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.id == id)
    }

    /// Human-readable chapter listing handed to the assistant.
    pub fn render_list(&self) -> String {
        let mut out = String::from("Available Book Chapters:\n\n");
        for ch in &self.chapters {
            out.push_str(&format!("- **{}**: {}\n", ch.id, ch.title));
            if !ch.description.is_empty() {
                out.push_str(&format!("  {}\n", ch.description));
            }
            if !ch.key_topics.is_empty() {
                out.push_str(&format!("  Key Topics: {}\n", ch.key_topics.join(", ")));
            }
            out.push('\n');
        }
        out
    }

    async fn read_overview(&self, id: &str) -> Result<Option<String>> {
        if !is_valid_chapter_id(id) {
            bail!("invalid chapter id: {}", id);
        }
        let Some(dir) = &self.docs_dir else {
            return Ok(None);
        };
        let path = dir.join(id).join("overview.mdx");
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Full chapter text used as input for personalization and translation.
    ///
    /// Falls back to a short synopsis when no overview file exists, and to a
    /// not-found message for chapters outside the catalog.
    pub async fn chapter_content(&self, id: &str) -> Result<String> {
        if let Some(text) = self.read_overview(id).await? {
            return Ok(text);
        }
        Ok(match self.find(id) {
            Some(ch) => format!("# {}\n\n{}", ch.title, ch.description),
            None => format!("Content for {} not found.", id),
        })
    }

    /// Chapter overview for the assistant, optionally prefixed by the
    /// chapter's learning objectives.
    pub async fn chapter_overview(&self, id: &str, include_context: bool) -> Result<String> {
        let Some(text) = self.read_overview(id).await? else {
            let ids: Vec<&str> = self.chapters.iter().map(|c| c.id.as_str()).collect();
            return Ok(format!(
                "Chapter {} not found. Available chapters: {}.",
                id,
                ids.join(", ")
            ));
        };

        let (title, objectives) = match self.find(id) {
            Some(ch) => (ch.title.as_str(), ch.objectives.as_slice()),
            None => (id, &[][..]),
        };

        let mut out = String::new();
        if include_context {
            out.push_str(&format!("Learning Objectives for {}:\n", title));
            for obj in objectives {
                out.push_str(&format!("- {}\n", obj));
            }
            out.push('\n');
        }

        let excerpt = truncate_chars(&text, OVERVIEW_CHARS);
        out.push_str(&format!(
            "Chapter Overview for {} ({}):\n\n{}",
            id, title, excerpt
        ));
        if excerpt.len() < text.len() {
            out.push_str("...");
        }
        Ok(out)
    }

    /// Ordered reading recommendations for a learner of `level`.
    pub fn learning_path(&self, level: ExperienceLevel) -> Vec<String> {
        let labelled: Vec<String> = self
            .chapters
            .iter()
            .enumerate()
            .map(|(i, ch)| format!("Chapter {}: {}", i + 1, ch.title))
            .collect();
        if labelled.is_empty() {
            return Vec::new();
        }

        let (selected, first_verb) = match level {
            ExperienceLevel::Beginner => (&labelled[..], "Start with"),
            ExperienceLevel::Intermediate => (&labelled[labelled.len().min(1)..], "Begin with"),
            ExperienceLevel::Advanced => (&labelled[labelled.len().saturating_sub(3)..], "Focus on"),
        };

        let last = selected.len().saturating_sub(1);
        let mut steps: Vec<String> = selected
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let verb = match i {
                    0 => first_verb,
                    i if i == last => "Finish with",
                    _ => "Continue with",
                };
                format!("{} {}", verb, label)
            })
            .collect();

        if level == ExperienceLevel::Advanced {
            steps.push("Review other chapters for foundational reinforcement as needed".to_string());
        }
        steps
    }
}
