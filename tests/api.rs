use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use book_tutor::server::app_router;
use book_tutor::testing::{test_context, TestBackends};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

async fn build_test_router() -> (TempDir, TestBackends, Router) {
    let tmp = tempdir().unwrap();
    let backends = test_context(&tmp.path().join("api.sqlite"), None)
        .await
        .unwrap();
    let app = app_router(backends.ctx.clone());
    (tmp, backends, app)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("X-User-Id", user);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn health_endpoints() {
    let (_tmp, _b, app) = build_test_router().await;

    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (_, root) = send(&app, Method::GET, "/", None, None).await;
    assert_eq!(root["status"], "running");

    let (_, chat) = send(&app, Method::GET, "/api/chat/health", None, None).await;
    assert_eq!(chat["agent"], "BookAssistant");
    assert_eq!(chat["vector_store"], "memory");
    assert_eq!(chat["tools"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn sessions_require_identity() {
    let (_tmp, _b, app) = build_test_router().await;

    let (status, body) = send(&app, Method::GET, "/api/chat/sessions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = send(&app, Method::GET, "/api/profile", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn session_lifecycle() {
    let (_tmp, _b, app) = build_test_router().await;

    let (status, created) = send(
        &app,
        Method::POST,
        "/api/chat/sessions",
        Some("alice"),
        Some(json!({ "title": "Study notes" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["title"], "Study notes");
    assert_eq!(created["message_count"], 0);
    let id = created["id"].as_str().unwrap().to_string();

    let (_, list) = send(&app, Method::GET, "/api/chat/sessions?limit=5", Some("alice"), None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let uri = format!("/api/chat/sessions/{}", id);
    let (status, body) = send(&app, Method::GET, &uri, Some("mallory"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["message"], "Session not found");

    let (status, body) = send(&app, Method::DELETE, &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Session deleted");

    let (status, _) = send(&app, Method::GET, &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_query_creates_session_for_identified_user() {
    let (_tmp, b, app) = build_test_router().await;
    b.index(&[("chapter-3", "Chain-of-thought prompting asks the model to reason step by step.")])
        .await
        .unwrap();
    b.model
        .push_tool_call("call_1", "search_book", json!({ "query": "chain-of-thought" }));
    b.model.push_text("Reason step by step [1].");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/chat/query",
        Some("alice"),
        Some(json!({ "query": "What is chain-of-thought?" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], "Reason step by step [1].");
    assert_eq!(body["tool_calls"][0]["tool"], "search_book");
    assert_eq!(body["tool_calls"][0]["status"], "completed");
    assert_eq!(body["agent"], "BookAssistant");
    let session_id = body["session_id"].as_str().unwrap();

    let (_, detail) = send(
        &app,
        Method::GET,
        &format!("/api/chat/sessions/{}", session_id),
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(detail["title"], "What is chain-of-thought?");
    assert_eq!(detail["messages"].as_array().unwrap().len(), 2);
    assert_eq!(detail["messages"][1]["role"], "assistant");
}

#[tokio::test]
async fn anonymous_chat_query_has_no_session() {
    let (_tmp, b, app) = build_test_router().await;
    b.model.push_text("Hello!");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/chat/query",
        None,
        Some(json!({
            "query": "hi",
            "conversation_history": [{ "role": "user", "content": "earlier" }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["session_id"].is_null());
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let (_tmp, _b, app) = build_test_router().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/chat/query",
        None,
        Some(json!({ "question": "missing query field" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn legacy_query_returns_citations() {
    let (_tmp, b, app) = build_test_router().await;
    b.index(&[("chapter-5", "Agents call functions in a loop until done.")])
        .await
        .unwrap();
    b.model.push_text("Agents loop over function calls [1].");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/chat/query/legacy",
        None,
        Some(json!({ "query": "How do agents call functions?" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], "Agents loop over function calls [1].");
    assert_eq!(body["citations"][0]["id"], 1);
    assert_eq!(body["citations"][0]["chapter"], "chapter-5");
}

#[tokio::test]
async fn profile_then_personalize() {
    let (_tmp, b, app) = build_test_router().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/content/personalize",
        Some("bob"),
        Some(json!({ "chapter_id": "chapter-2" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Please complete your profile first");

    let (status, _) = send(&app, Method::GET, "/api/profile", Some("bob"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, profile) = send(
        &app,
        Method::PUT,
        "/api/profile",
        Some("bob"),
        Some(json!({ "experience_level": "advanced", "known_languages": ["Rust"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["experience_level"], "advanced");
    assert_eq!(profile["hardware_tier"], "medium");

    b.model.push_text("Advanced take on LLMs");
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/content/personalize",
        Some("bob"),
        Some(json!({ "chapter_id": "chapter-2" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "Advanced take on LLMs");
    assert_eq!(body["cached"], false);

    let (_, again) = send(
        &app,
        Method::POST,
        "/api/content/personalize",
        Some("bob"),
        Some(json!({ "chapter_id": "chapter-2" })),
    )
    .await;
    assert_eq!(again["cached"], true);
}

#[tokio::test]
async fn personalize_requires_identity() {
    let (_tmp, _b, app) = build_test_router().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/content/personalize",
        None,
        Some(json!({ "chapter_id": "chapter-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        body["error"]["message"],
        "Authentication required for personalization"
    );
}

#[tokio::test]
async fn translate_rejects_unsupported_language() {
    let (_tmp, b, app) = build_test_router().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/content/translate",
        None,
        Some(json!({ "chapter_id": "chapter-1", "target_language": "de" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"]["message"],
        "Only Urdu (ur) translation is currently supported"
    );

    b.model.push_text("اردو");
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/content/translate",
        None,
        Some(json!({ "chapter_id": "chapter-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "اردو");
}

#[tokio::test]
async fn chapter_content_endpoints() {
    let (_tmp, _b, app) = build_test_router().await;

    let (_, list) = send(&app, Method::GET, "/api/content/chapters", None, None).await;
    assert_eq!(list["chapters"].as_array().unwrap().len(), 6);
    assert_eq!(list["chapters"][3]["id"], "chapter-4");

    let (status, body) = send(&app, Method::GET, "/api/content/chapter/chapter-9", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "Content for chapter-9 not found.");

    let (status, _) = send(&app, Method::GET, "/api/content/chapter/Bad.Id", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_query_string_is_json_bad_request() {
    let (_tmp, _b, app) = build_test_router().await;

    let request = Request::builder()
        .uri("/api/chat/sessions?limit=abc")
        .header("X-User-Id", "alice")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("application/json"));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("limit"));
}
