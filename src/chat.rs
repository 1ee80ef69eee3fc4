//! Chat sessions and persisted history.
//!
//! Identified callers get their turns stored in `chat_sessions` /
//! `chat_messages`; the stored tail of a session is replayed to the agent as
//! conversation history. Anonymous callers supply their own history and
//! nothing is stored.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::agent::{self, AgentRequest, ToolCallRecord};
use crate::context::AppContext;
use crate::error::ApiError;
use crate::models::{
    format_ts, truncate_chars, ChatMessage, ChatSessionDetail, ChatSessionSummary,
    HistoryMessage, MessageRole,
};
use crate::profile;

pub const DEFAULT_TITLE: &str = "New Chat";
const TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub selected_text: Option<String>,
    #[serde(default)]
    pub chapter_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Used only for anonymous callers.
    #[serde(default)]
    pub conversation_history: Option<Vec<HistoryMessage>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub answer: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub model: String,
    pub agent: String,
    pub session_id: Option<String>,
}

fn session_not_found() -> anyhow::Error {
    ApiError::NotFound("Session not found".into()).into()
}

/// Session title derived from the opening question.
pub fn title_from_query(query: &str) -> String {
    let head = truncate_chars(query, TITLE_CHARS);
    if head.len() < query.len() {
        format!("{}...", head)
    } else {
        head.to_string()
    }
}

async fn insert_session(
    conn: &mut SqliteConnection,
    user_id: &str,
    title: Option<&str>,
    now: i64,
) -> Result<ChatSessionSummary> {
    profile::ensure_user(&mut *conn, user_id).await?;

    let id = uuid::Uuid::new_v4().to_string();
    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TITLE)
        .to_string();

    sqlx::query(
        "INSERT INTO chat_sessions (id, user_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(&title)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(ChatSessionSummary {
        id,
        title,
        created_at: format_ts(now),
        updated_at: format_ts(now),
        message_count: 0,
    })
}

pub async fn create_session(
    pool: &SqlitePool,
    user_id: &str,
    title: Option<&str>,
) -> Result<ChatSessionSummary> {
    let mut tx = pool.begin().await?;
    let session = insert_session(&mut tx, user_id, title, Utc::now().timestamp()).await?;
    tx.commit().await?;
    Ok(session)
}

/// Sessions owned by `user_id`, most recently updated first.
pub async fn list_sessions(
    pool: &SqlitePool,
    user_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<ChatSessionSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT s.id, s.title, s.created_at, s.updated_at, COUNT(m.id) AS message_count
        FROM chat_sessions s
        LEFT JOIN chat_messages m ON m.session_id = s.id
        WHERE s.user_id = ?
        GROUP BY s.id
        ORDER BY s.updated_at DESC, s.created_at DESC, s.rowid DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(user_id)
    .bind(limit.max(0))
    .bind(offset.max(0))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ChatSessionSummary {
            id: row.get("id"),
            title: row.get("title"),
            created_at: format_ts(row.get("created_at")),
            updated_at: format_ts(row.get("updated_at")),
            message_count: row.get("message_count"),
        })
        .collect())
}

async fn load_messages(pool: &SqlitePool, session_id: &str) -> Result<Vec<ChatMessage>> {
    let rows = sqlx::query(
        "SELECT id, role, content, model, created_at FROM chat_messages WHERE session_id = ? ORDER BY created_at ASC, seq ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let role: String = row.get("role");
            ChatMessage {
                id: row.get("id"),
                role: MessageRole::from_db(&role),
                content: row.get("content"),
                model: row.get("model"),
                created_at: format_ts(row.get("created_at")),
            }
        })
        .collect())
}

/// A session with its messages. Sessions owned by other users are reported
/// as not found.
pub async fn get_session(
    pool: &SqlitePool,
    user_id: &str,
    session_id: &str,
) -> Result<ChatSessionDetail> {
    let row = sqlx::query(
        "SELECT id, title, created_at, updated_at FROM chat_sessions WHERE id = ? AND user_id = ?",
    )
    .bind(session_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(session_not_found)?;

    Ok(ChatSessionDetail {
        id: row.get("id"),
        title: row.get("title"),
        created_at: format_ts(row.get("created_at")),
        updated_at: format_ts(row.get("updated_at")),
        messages: load_messages(pool, session_id).await?,
    })
}

pub async fn delete_session(pool: &SqlitePool, user_id: &str, session_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ? AND user_id = ?")
        .bind(session_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(session_not_found());
    }
    Ok(())
}

async fn save_message(
    conn: &mut SqliteConnection,
    session_id: &str,
    role: MessageRole,
    content: &str,
    model: Option<&str>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO chat_messages (id, session_id, role, content, model, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(session_id)
    .bind(role.as_str())
    .bind(content)
    .bind(model)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(session_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Answer a chat turn with the book assistant.
pub async fn chat_query(
    ctx: &AppContext,
    user_id: Option<&str>,
    req: ChatRequest,
) -> Result<ChatResponse> {
    if req.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()).into());
    }

    let Some(user_id) = user_id else {
        let answer = agent::run(
            ctx,
            AgentRequest {
                query: req.query,
                selected_text: req.selected_text,
                chapter_id: req.chapter_id,
                profile: None,
                history: req.conversation_history.unwrap_or_default(),
            },
        )
        .await?;
        return Ok(ChatResponse {
            answer: answer.answer,
            tool_calls: answer.tool_calls,
            model: answer.model,
            agent: answer.agent,
            session_id: None,
        });
    };

    let pool = &ctx.pool;
    let (existing, history) = match req.session_id.as_deref() {
        Some(id) => {
            let session = get_session(pool, user_id, id).await?;
            let keep = ctx.config.agent.session_history;
            let start = session.messages.len().saturating_sub(keep);
            let history = session.messages[start..]
                .iter()
                .map(|m| HistoryMessage {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect();
            (Some(session.id), history)
        }
        None => (None, Vec::new()),
    };

    let profile = profile::get_profile(pool, user_id).await?;
    let query = req.query;
    let answer = agent::run(
        ctx,
        AgentRequest {
            query: query.clone(),
            selected_text: req.selected_text,
            chapter_id: req.chapter_id,
            profile,
            history,
        },
    )
    .await?;

    // The turn is stored only once the assistant has answered.
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    let session_id = match existing {
        Some(id) => id,
        None => {
            insert_session(&mut tx, user_id, Some(&title_from_query(&query)), now)
                .await?
                .id
        }
    };
    save_message(&mut tx, &session_id, MessageRole::User, &query, None, now).await?;
    save_message(
        &mut tx,
        &session_id,
        MessageRole::Assistant,
        &answer.answer,
        Some(&answer.model),
        now,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        user = user_id,
        session = %session_id,
        tools = answer.tool_calls.len(),
        "chat turn completed"
    );

    Ok(ChatResponse {
        answer: answer.answer,
        tool_calls: answer.tool_calls,
        model: answer.model,
        agent: answer.agent,
        session_id: Some(session_id),
    })
}
