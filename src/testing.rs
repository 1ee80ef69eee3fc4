//! In-process backends for tests and offline runs.
//!
//! - [`HashEmbedder`] — deterministic bag-of-words hashing embedder.
//! - [`InMemoryVectorStore`] — brute-force cosine search behind an `RwLock`.
//! - [`ScriptedModel`] — replays queued completions and records requests.
//! - [`StubServer`] — a loopback HTTP server with queued replies, for
//!   exercising the real HTTP clients.
//!
//! Apart from [`StubServer`], which only listens on 127.0.0.1, none of these
//! touch the network. [`test_context`] wires them into an [`AppContext`] on a
//! fresh SQLite file.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::config::parse_config;
use crate::context::AppContext;

use crate::embedding::{cosine_similarity, EmbeddingProvider, InputKind};
use crate::llm::{ChatModel, Completion, CompletionRequest, FunctionCall, LlmError, ToolCall};
use crate::vector_store::{ScoredPoint, VectorPoint, VectorStore};

/// Embeds text by hashing lowercase words into `dims` buckets, then
/// L2-normalising. Texts sharing words score higher under cosine similarity.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            // FNV-1a
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.to_lowercase().bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % self.dims as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String], _kind: InputKind) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    points: RwLock<Vec<(String, Vec<f32>, serde_json::Value)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embed and store `(chapter_id, text)` passages.
    pub async fn index_texts(
        &self,
        embedder: &dyn EmbeddingProvider,
        passages: &[(&str, &str)],
    ) -> Result<usize> {
        let texts: Vec<String> = passages.iter().map(|(_, t)| t.to_string()).collect();
        let vectors = embedder.embed(&texts, InputKind::SearchDocument).await?;
        let points = passages
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, ((chapter, text), vector))| VectorPoint {
                id: Some(format!("p{}", i)),
                vector,
                payload: json!({ "text": text, "chapter_id": chapter, "source": format!("{}/overview.mdx", chapter) }),
            })
            .collect();
        self.upsert(points).await
    }

    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn ensure_collection(&self, _dims: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<usize> {
        let mut stored = self
            .points
            .write()
            .map_err(|_| anyhow::anyhow!("vector store lock poisoned"))?;
        let count = points.len();
        for p in points {
            let id = p.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            stored.retain(|(existing, _, _)| existing != &id);
            stored.push((id, p.vector, p.payload));
        }
        Ok(count)
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        chapter_filter: Option<&str>,
    ) -> Result<Vec<ScoredPoint>> {
        let stored = self
            .points
            .read()
            .map_err(|_| anyhow::anyhow!("vector store lock poisoned"))?;
        let mut hits: Vec<ScoredPoint> = stored
            .iter()
            .filter(|(_, _, payload)| {
                chapter_filter.map_or(true, |c| payload["chapter_id"] == c)
            })
            .map(|(id, v, payload)| ScoredPoint {
                id: id.clone(),
                score: cosine_similarity(vector, v) as f64,
                payload: payload.clone(),
            })
            .filter(|hit| hit.score > 0.0)
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_by_chapter(&self, chapter_id: &str) -> Result<()> {
        let mut stored = self
            .points
            .write()
            .map_err(|_| anyhow::anyhow!("vector store lock poisoned"))?;
        stored.retain(|(_, _, payload)| payload["chapter_id"] != chapter_id);
        Ok(())
    }
}

/// A chat model that replays queued completions in order. Once the queue is
/// empty it answers with `"ok"`. Every request is recorded.
pub struct ScriptedModel {
    model: String,
    replies: Mutex<VecDeque<Completion>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            model: "scripted/model".to_string(),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a plain text reply.
    pub fn push_text(&self, text: &str) {
        self.push(Completion {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
            model: self.model.clone(),
        });
    }

    /// Queue a reply that calls one tool with JSON `arguments`.
    pub fn push_tool_call(&self, id: &str, name: &str, arguments: serde_json::Value) {
        self.push(Completion {
            content: None,
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }],
            model: self.model.clone(),
        });
    }

    pub fn push(&self, completion: Completion) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(completion);
        }
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        Ok(next.unwrap_or_else(|| Completion {
            content: Some("ok".to_string()),
            tool_calls: Vec::new(),
            model: self.model.clone(),
        }))
    }
}

/// One request received by a [`StubServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Path plus query string.
    pub path: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    /// Request body parsed as JSON; `Null` when empty or not JSON.
    pub body: Value,
}

#[derive(Clone, Default)]
struct StubState {
    replies: Arc<Mutex<VecDeque<(u16, Value)>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

/// Loopback HTTP server answering every route from a reply queue
/// (`200 {}` once the queue is empty) and recording what it received.
pub struct StubServer {
    pub base_url: String,
    state: StubState,
    handle: tokio::task::JoinHandle<()>,
}

impl StubServer {
    pub async fn start() -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = StubState::default();
        let app = Router::new()
            .fallback(stub_handler)
            .with_state(state.clone());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self {
            base_url: format!("http://{}", addr),
            state,
            handle,
        })
    }

    pub fn push(&self, status: u16, body: Value) {
        self.state
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((status, body));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn stub_handler(
    State(state): State<StubState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let recorded = RecordedRequest {
        method: method.to_string(),
        path: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers: headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect(),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    };
    state
        .requests
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(recorded);

    let (status, reply) = state
        .replies
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pop_front()
        .unwrap_or((200, json!({})));
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply)).into_response()
}

/// An address on loopback with nothing listening, for connection failures.
pub fn closed_local_url() -> Result<String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{}", addr))
}

/// An [`AppContext`] backed entirely by in-process fakes, plus handles to
/// the fakes so tests can seed passages and script replies.
pub struct TestBackends {
    pub ctx: AppContext,
    pub model: Arc<ScriptedModel>,
    pub store: Arc<InMemoryVectorStore>,
    pub embedder: Arc<HashEmbedder>,
}

impl TestBackends {
    pub async fn index(&self, passages: &[(&str, &str)]) -> Result<usize> {
        self.store.index_texts(self.embedder.as_ref(), passages).await
    }
}

/// Build a migrated database at `db_path` and a context using fake backends.
pub async fn test_context(db_path: &Path, docs_dir: Option<&Path>) -> Result<TestBackends> {
    let mut config = parse_config("[db]\npath = \"tutor.sqlite\"\n\n[server]\n")?;
    config.db.path = db_path.to_path_buf();
    config.book.docs_dir = docs_dir.map(Path::to_path_buf);

    let pool = crate::db::connect(&config).await?;
    crate::migrate::run_migrations(&pool).await?;

    let model = Arc::new(ScriptedModel::new());
    let store = Arc::new(InMemoryVectorStore::new());
    let embedder = Arc::new(HashEmbedder::new(64));
    let ctx = AppContext::new(
        config,
        pool,
        embedder.clone(),
        store.clone(),
        model.clone(),
    );
    Ok(TestBackends {
        ctx,
        model,
        store,
        embedder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_embedder_similarity() {
        let e = HashEmbedder::new(128);
        let a = e.embed_one("vector databases store embeddings");
        let b = e.embed_one("Embeddings in vector databases");
        let c = e.embed_one("transformer tokenization");
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    async fn test_scripted_model_replays_then_defaults() {
        let m = ScriptedModel::new();
        m.push_text("first");
        let req = CompletionRequest::default();
        assert_eq!(
            m.complete(&req).await.unwrap().content.as_deref(),
            Some("first")
        );
        assert_eq!(m.complete(&req).await.unwrap().content.as_deref(), Some("ok"));
        assert_eq!(m.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_stub_server_replays_and_records() {
        let stub = StubServer::start().await.unwrap();
        stub.push(503, json!({ "error": "busy" }));

        let client = reqwest::Client::new();
        let first = client
            .post(format!("{}/v1/thing?x=1", stub.base_url))
            .header("api-key", "k")
            .json(&json!({ "a": 1 }))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status().as_u16(), 503);
        let second = client.get(&stub.base_url).send().await.unwrap();
        assert_eq!(second.status().as_u16(), 200);

        let requests = stub.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/v1/thing?x=1");
        assert_eq!(requests[0].headers["api-key"], "k");
        assert_eq!(requests[0].body["a"], 1);
        assert_eq!(requests[1].body, Value::Null);
    }
}
