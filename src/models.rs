//! Core data types shared by the chat, content, and profile services.
//!
//! Rows are stored with Unix-second timestamps; the response types here carry
//! them pre-formatted as RFC 3339 strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How much background the learner brings. Drives prompt wording only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl ExperienceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceLevel::Beginner => "beginner",
            ExperienceLevel::Intermediate => "intermediate",
            ExperienceLevel::Advanced => "advanced",
        }
    }

    /// Parse a level name, treating anything unrecognised as beginner.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "intermediate" => ExperienceLevel::Intermediate,
            "advanced" => ExperienceLevel::Advanced,
            _ => ExperienceLevel::Beginner,
        }
    }
}

impl fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareTier {
    Low,
    #[default]
    Medium,
    High,
}

impl HardwareTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareTier::Low => "low",
            HardwareTier::Medium => "medium",
            HardwareTier::High => "high",
        }
    }

    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => HardwareTier::Low,
            "high" => HardwareTier::High,
            _ => HardwareTier::Medium,
        }
    }
}

impl fmt::Display for HardwareTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A learner's profile, used as prompt-formatting parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserProfile {
    pub user_id: String,
    pub experience_level: ExperienceLevel,
    pub known_languages: Vec<String>,
    pub hardware_tier: HardwareTier,
    pub goals: Vec<String>,
}

/// Partial profile update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub experience_level: Option<ExperienceLevel>,
    pub known_languages: Option<Vec<String>>,
    pub hardware_tier: Option<HardwareTier>,
    pub goals: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn from_db(value: &str) -> Self {
        if value == "assistant" {
            MessageRole::Assistant
        } else {
            MessageRole::User
        }
    }
}

/// A prior turn of conversation, as sent by clients or loaded from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
}

/// A stored chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub model: Option<String>,
    pub created_at: String,
}

/// Session listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
}

/// A session with its full message list.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSessionDetail {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<ChatMessage>,
}

/// A retrieved passage referenced by a RAG answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub id: usize,
    pub source: String,
    pub chapter: String,
    pub score: f64,
}

/// Personalized or translated chapter text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedContent {
    pub content: String,
    /// True when served from the content cache.
    pub cached: bool,
}

/// Render a Unix timestamp as RFC 3339 (UTC).
pub fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_level_parsing() {
        assert_eq!(
            ExperienceLevel::parse_lenient("Advanced"),
            ExperienceLevel::Advanced
        );
        assert_eq!(
            ExperienceLevel::parse_lenient("guru"),
            ExperienceLevel::Beginner
        );
        assert_eq!(HardwareTier::parse_lenient("HIGH"), HardwareTier::High);
        assert_eq!(HardwareTier::parse_lenient(""), HardwareTier::Medium);
    }

    #[test]
    fn test_truncate_chars_respects_code_points() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("اردو متن", 4), "اردو");
    }

    #[test]
    fn test_format_ts() {
        assert_eq!(format_ts(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_history_message_wire_format() {
        let msg: HistoryMessage =
            serde_json::from_str(r#"{"role":"assistant","content":"hi"}"#).unwrap();
        assert_eq!(msg.role, MessageRole::Assistant);
    }
}
