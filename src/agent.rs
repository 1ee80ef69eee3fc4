//! The book assistant: a bounded tool-calling loop.
//!
//! One run sends the assistant instructions plus a composed input message,
//! then alternates between model completions and tool execution until the
//! model answers without calling a tool, or `agent.max_turns` completions
//! have been spent.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;

use crate::book::Catalog;
use crate::config::AgentConfig;
use crate::context::AppContext;
use crate::llm::{CompletionRequest, Message, ToolCall};
use crate::models::{truncate_chars, HistoryMessage, MessageRole, UserProfile};
use crate::tools::{ToolContext, ToolRegistry};

const INSTRUCTIONS_HEAD: &str = "You are an AI-powered learning assistant for an educational book about AI development.

## Your Capabilities:
1. **Search the book** - Use the search_book tool to find relevant content
2. **Get chapter content** - Use get_chapter_content to retrieve specific chapters
3. **List chapters** - Use list_chapters to show available content
4. **Explain concepts** - Use explain_concept for tailored explanations
5. **Plan learning** - Use get_learning_path to suggest an order of study

## Guidelines:
- Always search the book first before answering questions about AI topics
- Cite your sources using [1], [2], etc. format
- If information isn't in the book, say so and provide general knowledge with a disclaimer
- Adapt your explanations based on the user's experience level if known
- Be encouraging and supportive - learning AI can be challenging!

## Topics Covered in the Book:
";

const INSTRUCTIONS_TAIL: &str = "
## Response Format:
- Keep responses concise but informative
- Use markdown formatting for readability
- Include code examples when relevant
- Always cite which chapter the information comes from
";

#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub query: String,
    pub selected_text: Option<String>,
    pub chapter_id: Option<String>,
    pub profile: Option<UserProfile>,
    /// Prior turns, oldest first.
    pub history: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Completed,
    Failed,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Completed => "completed",
            ToolStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentAnswer {
    pub answer: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub model: String,
    pub agent: String,
}

/// System instructions, with the topic list rendered from the catalog.
pub fn instructions(catalog: &Catalog) -> String {
    let mut out = String::from(INSTRUCTIONS_HEAD);
    for (i, ch) in catalog.chapters().iter().enumerate() {
        if ch.key_topics.is_empty() {
            out.push_str(&format!("- Chapter {}: {}\n", i + 1, ch.title));
        } else {
            out.push_str(&format!(
                "- Chapter {}: {} ({})\n",
                i + 1,
                ch.title,
                ch.key_topics.join(", ")
            ));
        }
    }
    out.push_str(INSTRUCTIONS_TAIL);
    out
}

/// Compose the single user message the agent sees.
pub fn build_input(req: &AgentRequest, config: &AgentConfig) -> String {
    let mut parts = Vec::new();

    if !req.history.is_empty() {
        let start = req.history.len().saturating_sub(config.history_window);
        let lines: Vec<String> = req.history[start..]
            .iter()
            .map(|m| {
                let speaker = match m.role {
                    MessageRole::User => "User",
                    MessageRole::Assistant => "Assistant",
                };
                format!(
                    "{}: {}",
                    speaker,
                    truncate_chars(&m.content, config.history_chars)
                )
            })
            .collect();
        parts.push(format!("Previous conversation:\n{}", lines.join("\n")));
    }

    if let Some(selected) = req.selected_text.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!(
            "The user has selected this text for context:\n\"{}\"",
            truncate_chars(selected, config.selected_text_chars)
        ));
    }

    if let Some(chapter) = req.chapter_id.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Focus on: {}", chapter));
    }

    if let Some(profile) = &req.profile {
        parts.push(format!("User level: {}", profile.experience_level));
        if !profile.known_languages.is_empty() {
            parts.push(format!(
                "Known languages: {}",
                profile.known_languages.join(", ")
            ));
        }
    }

    parts.push(format!("Current question: {}", req.query));
    parts.join("\n\n")
}

async fn dispatch(
    registry: &ToolRegistry,
    call: &ToolCall,
    tool_ctx: &ToolContext,
) -> (String, ToolStatus) {
    let Some(tool) = registry.find(&call.function.name) else {
        return (
            format!("Error: unknown tool: {}", call.function.name),
            ToolStatus::Failed,
        );
    };

    let raw = call.function.arguments.trim();
    let params: Value = if raw.is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return (
                    format!("Error: invalid arguments: {}", e),
                    ToolStatus::Failed,
                )
            }
        }
    };

    match tool.execute(params, tool_ctx).await {
        Ok(output) => (output, ToolStatus::Completed),
        Err(e) => (format!("Error: {:#}", e), ToolStatus::Failed),
    }
}

pub async fn run(ctx: &AppContext, req: AgentRequest) -> Result<AgentAnswer> {
    let agent = &ctx.config.agent;
    let tool_ctx = ToolContext::from_app(ctx);
    let specs = ctx.tools.specs();

    let mut messages = vec![
        Message::system(instructions(&ctx.catalog)),
        Message::user(build_input(&req, agent)),
    ];
    let mut records = Vec::new();

    for turn in 0..agent.max_turns {
        let request = CompletionRequest {
            messages: messages.clone(),
            tools: specs.clone(),
            temperature: Some(ctx.config.llm.temperature),
            max_tokens: Some(agent.max_tokens),
        };
        let completion = ctx.llm.complete(&request).await?;

        if completion.tool_calls.is_empty() {
            tracing::debug!(turn, tools = records.len(), "agent finished");
            let model = completion.model.clone();
            return Ok(AgentAnswer {
                answer: completion.into_text()?,
                tool_calls: records,
                model,
                agent: agent.name.clone(),
            });
        }

        let calls = completion.tool_calls;
        messages.push(Message::Assistant {
            content: completion.content,
            tool_calls: calls.clone(),
        });

        for call in &calls {
            let (output, status) = dispatch(&ctx.tools, call, &tool_ctx).await;
            if status == ToolStatus::Failed {
                tracing::warn!(tool = %call.function.name, %output, "tool call failed");
            }
            records.push(ToolCallRecord {
                tool: call.function.name.clone(),
                status,
            });
            messages.push(Message::tool(call.id.clone(), output));
        }
    }

    bail!("max turns ({}) exceeded", agent.max_turns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::default_chapters;
    use crate::models::ExperienceLevel;
    use crate::testing::test_context;
    use serde_json::json;
    use tempfile::TempDir;

    fn history(n: usize) -> Vec<HistoryMessage> {
        (0..n)
            .map(|i| HistoryMessage {
                role: if i % 2 == 0 {
                    MessageRole::User
                } else {
                    MessageRole::Assistant
                },
                content: format!("message {}", i),
            })
            .collect()
    }

    fn agent_config() -> AgentConfig {
        crate::config::parse_config("[db]\npath = \"x\"\n[server]\n")
            .unwrap()
            .agent
    }

    #[test]
    fn test_instructions_list_catalog_topics() {
        let text = instructions(&Catalog::new(default_chapters(), None));
        assert!(text.contains(
            "- Chapter 4: RAG Systems (Embeddings, Vector Databases, Retrieval Methods)\n"
        ));
        assert!(text.trim_end().ends_with("Always cite which chapter the information comes from"));
    }

    #[test]
    fn test_build_input_minimal() {
        let req = AgentRequest {
            query: "What is RAG?".into(),
            ..Default::default()
        };
        assert_eq!(build_input(&req, &agent_config()), "Current question: What is RAG?");
    }

    #[test]
    fn test_build_input_full() {
        let req = AgentRequest {
            query: "Explain".into(),
            selected_text: Some("s".repeat(600)),
            chapter_id: Some("chapter-2".into()),
            profile: Some(UserProfile {
                experience_level: ExperienceLevel::Intermediate,
                known_languages: vec!["Go".into()],
                ..Default::default()
            }),
            history: history(8),
        };
        let input = build_input(&req, &agent_config());
        let blocks: Vec<&str> = input.split("\n\n").collect();
        assert!(blocks[0].starts_with("Previous conversation:\nUser: message 2\n"));
        assert!(blocks[0].ends_with("Assistant: message 7"));
        assert_eq!(blocks[0].lines().count(), 7);
        assert_eq!(
            blocks[1],
            format!("The user has selected this text for context:\n\"{}\"", "s".repeat(500))
        );
        assert_eq!(blocks[2], "Focus on: chapter-2");
        assert_eq!(blocks[3], "User level: intermediate");
        assert_eq!(blocks[4], "Known languages: Go");
        assert_eq!(blocks[5], "Current question: Explain");
    }

    #[test]
    fn test_history_entries_truncated() {
        let req = AgentRequest {
            query: "q".into(),
            history: vec![HistoryMessage {
                role: MessageRole::Assistant,
                content: "a".repeat(400),
            }],
            ..Default::default()
        };
        let input = build_input(&req, &agent_config());
        let first_line = input.lines().nth(1).unwrap();
        assert_eq!(first_line.len(), "Assistant: ".len() + 300);
    }

    #[tokio::test]
    async fn test_run_dispatches_tools_then_answers() {
        let tmp = TempDir::new().unwrap();
        let t = test_context(&tmp.path().join("t.sqlite"), None).await.unwrap();
        t.index(&[("chapter-4", "Embeddings power retrieval.")])
            .await
            .unwrap();
        t.model
            .push_tool_call("call_1", "search_book", json!({ "query": "embeddings" }));
        t.model.push_text("Embeddings power retrieval [1].");

        let answer = run(
            &t.ctx,
            AgentRequest {
                query: "What powers retrieval?".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(answer.answer, "Embeddings power retrieval [1].");
        assert_eq!(answer.agent, "BookAssistant");
        assert_eq!(answer.model, "scripted/model");
        assert_eq!(
            answer.tool_calls,
            vec![ToolCallRecord {
                tool: "search_book".into(),
                status: ToolStatus::Completed
            }]
        );

        let requests = t.model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].max_tokens, Some(600));
        assert_eq!(requests[0].tools.len(), 5);
        match requests[1].messages.last().unwrap() {
            Message::Tool {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "call_1");
                assert!(content.starts_with("[1] (Chapter: chapter-4"));
            }
            other => panic!("expected tool message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_tool_is_reported_to_model() {
        let tmp = TempDir::new().unwrap();
        let t = test_context(&tmp.path().join("t.sqlite"), None).await.unwrap();
        t.model
            .push_tool_call("call_1", "search_book", json!({ "query": "" }));
        t.model.push_tool_call("call_2", "delete_everything", json!({}));
        t.model.push_text("Sorry, I could not search.");

        let answer = run(
            &t.ctx,
            AgentRequest {
                query: "hi".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(answer.tool_calls.len(), 2);
        assert!(answer
            .tool_calls
            .iter()
            .all(|r| r.status == ToolStatus::Failed));

        let requests = t.model.requests();
        match requests[1].messages.last().unwrap() {
            Message::Tool { content, .. } => {
                assert_eq!(content, "Error: query must not be empty")
            }
            other => panic!("expected tool message, got {:?}", other),
        }
        match requests[2].messages.last().unwrap() {
            Message::Tool { content, .. } => {
                assert_eq!(content, "Error: unknown tool: delete_everything")
            }
            other => panic!("expected tool message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_turn_limit_exceeded() {
        let tmp = TempDir::new().unwrap();
        let t = test_context(&tmp.path().join("t.sqlite"), None).await.unwrap();
        for i in 0..5 {
            t.model
                .push_tool_call(&format!("call_{}", i), "list_chapters", json!({}));
        }

        let err = run(
            &t.ctx,
            AgentRequest {
                query: "loop forever".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "max turns (5) exceeded");
        assert_eq!(t.model.requests().len(), 5);
    }
}
