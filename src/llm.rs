//! OpenAI-compatible chat-completion client.
//!
//! Works against OpenRouter (default) or OpenAI directly. Supports function
//! calling: requests may advertise tools, and responses may carry
//! `tool_calls` instead of (or alongside) text content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::embedding::backoff_delay;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("model returned an empty response")]
    Empty,
    #[error("missing API key: set {0}")]
    MissingApiKey(String),
}

/// One message in a chat transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the model produced it.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    /// Function specs in OpenAI `tools` format.
    pub tools: Vec<Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
}

impl Completion {
    /// The text content, or [`LlmError::Empty`] when the model produced none.
    pub fn into_text(self) -> Result<String, LlmError> {
        self.content
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::Empty)
    }
}

/// A chat model that can complete a transcript.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

/// Client for any `/chat/completions` endpoint following the OpenAI schema.
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    model: String,
    extra_headers: Vec<(&'static str, String)>,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    /// Pick OpenRouter when configured and keyed, otherwise OpenAI.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let openrouter_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        if config.provider == "openrouter" {
            if let Some(api_key) = openrouter_key {
                return Ok(Self {
                    base_url: config.base_url.trim_end_matches('/').to_string(),
                    api_key,
                    model: config.model.clone(),
                    extra_headers: vec![
                        ("HTTP-Referer", config.referer.clone()),
                        ("X-Title", config.app_title.clone()),
                    ],
                    max_retries: config.max_retries,
                    client,
                });
            }
            tracing::warn!("OPENROUTER_API_KEY not set, falling back to OpenAI");
        }

        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LlmError::MissingApiKey("OPENROUTER_API_KEY or OPENAI_API_KEY".into()))?;
        let model = if config.provider == "openai" {
            config.model.clone()
        } else {
            config.openai_model.clone()
        };

        Ok(Self {
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            extra_headers: Vec::new(),
            max_retries: config.max_retries,
            client,
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
        }
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = self.request_body(request);
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let mut req = self.client.post(&url).bearer_auth(&self.api_key).json(&body);
            for (name, value) in &self.extra_headers {
                req = req.header(*name, value);
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "completion request error, retrying");
                    last_err = Some(LlmError::Http(e));
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                let json: Value = resp.json().await?;
                return parse_completion(&json, &self.model);
            }

            let message = resp.text().await.unwrap_or_default();
            let err = LlmError::Api {
                status: status.as_u16(),
                message,
            };
            if status.as_u16() == 429 || status.is_server_error() {
                tracing::warn!(%status, attempt, "completion request failed, retrying");
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_err.unwrap_or(LlmError::Empty))
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

fn parse_completion(json: &Value, default_model: &str) -> Result<Completion, LlmError> {
    let parsed: CompletionResponse =
        serde_json::from_value(json.clone()).map_err(|e| LlmError::Parse(e.to_string()))?;
    let choice = parsed.choices.into_iter().next().ok_or(LlmError::Empty)?;

    Ok(Completion {
        content: choice.message.content,
        tool_calls: choice.message.tool_calls.unwrap_or_default(),
        model: parsed.model.unwrap_or_else(|| default_model.to_string()),
    })
}
