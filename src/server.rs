//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Service banner |
//! | `GET` | `/health` | Liveness |
//! | `GET` | `/api/chat/health` | Assistant backends and tools |
//! | `POST`/`GET` | `/api/chat/sessions` | Create / list sessions (identified) |
//! | `GET`/`DELETE` | `/api/chat/sessions/{id}` | Read / delete a session (identified) |
//! | `POST` | `/api/chat/query` | Ask the book assistant |
//! | `POST` | `/api/chat/query/legacy` | Single-shot RAG answer with citations |
//! | `POST` | `/api/content/personalize` | Personalized chapter (identified) |
//! | `POST` | `/api/content/translate` | Translated chapter |
//! | `GET` | `/api/content/chapter/{id}` | Original chapter text |
//! | `GET` | `/api/content/chapters` | Chapter catalog |
//! | `GET`/`PUT` | `/api/profile` | Learner profile (identified) |
//!
//! # Identity
//!
//! The caller is identified by the `X-User-Id` header, set by the gateway in
//! front of this service. Requests without it are anonymous.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Session not found" } }
//! ```
//!
//! Codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `upstream` (502), `internal` (500).

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, HeaderValue},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::book::is_valid_chapter_id;
use crate::chat::{self, ChatRequest, ChatResponse};
use crate::context::AppContext;
use crate::error::ApiError;
use crate::models::{
    ChatSessionDetail, ChatSessionSummary, GeneratedContent, ProfileUpdate, UserProfile,
};
use crate::rag::{self, RagAnswer, RagRequest};
use crate::{personalize, profile, translate};

pub const USER_HEADER: &str = "x-user-id";
const MAX_USER_ID_LEN: usize = 128;

/// Identity of the caller, if any.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Option<String>);

impl CurrentUser {
    pub fn id(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// The user id, or 401 for anonymous callers.
    pub fn require(&self) -> Result<&str, ApiError> {
        self.id()
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".into()))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(raw) = parts.headers.get(USER_HEADER) else {
            return Ok(CurrentUser(None));
        };
        let value = raw
            .to_str()
            .map_err(|_| ApiError::BadRequest("invalid X-User-Id header".into()))?
            .trim();
        if value.is_empty() {
            return Ok(CurrentUser(None));
        }
        if value.len() > MAX_USER_ID_LEN {
            return Err(ApiError::BadRequest("X-User-Id header too long".into()));
        }
        Ok(CurrentUser(Some(value.to_string())))
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    params
        .map(|Query(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn path_param<T>(param: Result<Path<T>, PathRejection>) -> Result<T, ApiError> {
    param
        .map(|Path(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(values)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the router. Exposed separately from [`run_server`] so tests can
/// drive it in-process.
pub fn app_router(ctx: AppContext) -> Router {
    let cors = cors_layer(&ctx.config.server.cors_origins);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api/chat/health", get(handle_chat_health))
        .route(
            "/api/chat/sessions",
            post(handle_create_session).get(handle_list_sessions),
        )
        .route(
            "/api/chat/sessions/{id}",
            get(handle_get_session).delete(handle_delete_session),
        )
        .route("/api/chat/query", post(handle_chat_query))
        .route("/api/chat/query/legacy", post(handle_legacy_query))
        .route("/api/content/personalize", post(handle_personalize))
        .route("/api/content/translate", post(handle_translate))
        .route("/api/content/chapter/{id}", get(handle_chapter))
        .route("/api/content/chapters", get(handle_chapters))
        .route("/api/profile", get(handle_get_profile).put(handle_update_profile))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

/// Serve the API on `server.bind` until the process is stopped.
pub async fn run_server(ctx: AppContext) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let app = app_router(ctx);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    println!("Book tutor API listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Service info ============

async fn handle_root() -> Json<Value> {
    Json(json!({
        "name": "Book Tutor API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn handle_chat_health(State(ctx): State<AppContext>) -> Json<Value> {
    let tools: Vec<&str> = ctx.tools.tools().iter().map(|t| t.name()).collect();
    Json(json!({
        "status": "healthy",
        "agent": ctx.config.agent.name,
        "model": ctx.llm.model_name(),
        "embedding_model": ctx.embedder.model_name(),
        "vector_store": ctx.vectors.backend_name(),
        "tools": tools,
    }))
}

// ============ Sessions ============

#[derive(Debug, Default, Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    title: Option<String>,
}

async fn handle_create_session(
    State(ctx): State<AppContext>,
    user: CurrentUser,
    payload: Result<Json<CreateSessionBody>, JsonRejection>,
) -> Result<Json<ChatSessionSummary>, ApiError> {
    let user_id = user.require()?;
    let req = body(payload)?;
    let session = chat::create_session(&ctx.pool, user_id, req.title.as_deref()).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    20
}

async fn handle_list_sessions(
    State(ctx): State<AppContext>,
    user: CurrentUser,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Vec<ChatSessionSummary>>, ApiError> {
    let user_id = user.require()?;
    let params = query_params(params)?;
    let sessions = chat::list_sessions(&ctx.pool, user_id, params.limit, params.offset).await?;
    Ok(Json(sessions))
}

async fn handle_get_session(
    State(ctx): State<AppContext>,
    user: CurrentUser,
    id: Result<Path<String>, PathRejection>,
) -> Result<Json<ChatSessionDetail>, ApiError> {
    let user_id = user.require()?;
    let id = path_param(id)?;
    Ok(Json(chat::get_session(&ctx.pool, user_id, &id).await?))
}

async fn handle_delete_session(
    State(ctx): State<AppContext>,
    user: CurrentUser,
    id: Result<Path<String>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let user_id = user.require()?;
    let id = path_param(id)?;
    chat::delete_session(&ctx.pool, user_id, &id).await?;
    Ok(Json(json!({ "message": "Session deleted" })))
}

// ============ Queries ============

async fn handle_chat_query(
    State(ctx): State<AppContext>,
    user: CurrentUser,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let req = body(payload)?;
    Ok(Json(chat::chat_query(&ctx, user.id(), req).await?))
}

async fn handle_legacy_query(
    State(ctx): State<AppContext>,
    user: CurrentUser,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<RagAnswer>, ApiError> {
    let req = body(payload)?;
    if req.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }
    let profile = match user.id() {
        Some(id) => profile::get_profile(&ctx.pool, id).await?,
        None => None,
    };
    let answer = rag::query(
        &ctx,
        RagRequest {
            query: req.query,
            selected_text: req.selected_text,
            chapter_id: req.chapter_id,
            profile,
            top_k: None,
        },
    )
    .await?;
    Ok(Json(answer))
}

// ============ Content ============

#[derive(Debug, Deserialize)]
struct PersonalizeBody {
    chapter_id: String,
}

#[derive(Debug, Deserialize)]
struct TranslateBody {
    chapter_id: String,
    #[serde(default = "default_language")]
    target_language: String,
}

fn default_language() -> String {
    "ur".to_string()
}

async fn handle_personalize(
    State(ctx): State<AppContext>,
    user: CurrentUser,
    payload: Result<Json<PersonalizeBody>, JsonRejection>,
) -> Result<Json<GeneratedContent>, ApiError> {
    let req = body(payload)?;
    Ok(Json(
        personalize::personalize(&ctx, user.id(), &req.chapter_id).await?,
    ))
}

async fn handle_translate(
    State(ctx): State<AppContext>,
    user: CurrentUser,
    payload: Result<Json<TranslateBody>, JsonRejection>,
) -> Result<Json<GeneratedContent>, ApiError> {
    let req = body(payload)?;
    let out = translate::translate(&ctx, user.id(), &req.chapter_id, &req.target_language).await?;
    Ok(Json(out))
}

async fn handle_chapter(
    State(ctx): State<AppContext>,
    id: Result<Path<String>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = path_param(id)?;
    if !is_valid_chapter_id(&id) {
        return Err(ApiError::BadRequest(format!("invalid chapter id: {}", id)));
    }
    let content = ctx.catalog.chapter_content(&id).await?;
    Ok(Json(json!({ "chapter_id": id, "content": content })))
}

async fn handle_chapters(State(ctx): State<AppContext>) -> Json<Value> {
    Json(json!({ "chapters": ctx.catalog.chapters() }))
}

// ============ Profile ============

async fn handle_get_profile(
    State(ctx): State<AppContext>,
    user: CurrentUser,
) -> Result<Json<UserProfile>, ApiError> {
    let user_id = user.require()?;
    profile::get_profile(&ctx.pool, user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Profile not found".into()))
}

async fn handle_update_profile(
    State(ctx): State<AppContext>,
    user: CurrentUser,
    payload: Result<Json<ProfileUpdate>, JsonRejection>,
) -> Result<Json<UserProfile>, ApiError> {
    let user_id = user.require()?;
    let update = body(payload)?;
    Ok(Json(profile::update_profile(&ctx.pool, user_id, update).await?))
}
