//! Vector index over book passages.
//!
//! Two backends implement [`VectorStore`]:
//! - **[`QdrantStore`]** — talks to a Qdrant server over its REST API.
//! - **[`SqliteVectorStore`]** — keeps vectors as BLOBs in the local SQLite
//!   database and ranks them by cosine similarity in Rust. Suitable for
//!   small books and tests.
//!
//! Every point carries a JSON payload with at least `text`, `chapter_id`,
//! and `source`. Searches may be restricted to one chapter.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;

use crate::config::VectorStoreConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

/// A point to insert. Missing ids are assigned a fresh UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    #[serde(default)]
    pub id: Option<String>,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    pub payload: Value,
}

impl ScoredPoint {
    pub fn text(&self) -> &str {
        self.payload.get("text").and_then(Value::as_str).unwrap_or("")
    }

    pub fn chapter_id(&self) -> &str {
        self.payload
            .get("chapter_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    pub fn source(&self) -> &str {
        self.payload
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("Book Content")
    }

    /// Page number as display text; payloads may store it as a number or string.
    pub fn page_number(&self) -> String {
        match self.payload.get("page_number") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "N/A".to_string(),
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend identifier (`"qdrant"`, `"sqlite"`).
    fn backend_name(&self) -> &str;

    /// Create the collection if it does not exist yet.
    async fn ensure_collection(&self, dims: usize) -> Result<()>;

    /// Insert or replace points. Returns the number written.
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<usize>;

    /// Nearest neighbours by cosine similarity, best first.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        chapter_filter: Option<&str>,
    ) -> Result<Vec<ScoredPoint>>;

    /// Remove every point whose payload `chapter_id` matches.
    async fn delete_by_chapter(&self, chapter_id: &str) -> Result<()>;
}

fn chapter_of(payload: &Value) -> Option<String> {
    payload
        .get("chapter_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

// ============ Qdrant ============

pub struct QdrantStore {
    base_url: String,
    collection: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl QdrantStore {
    /// Build a client for the configured server. `QDRANT_API_KEY` is sent as
    /// the `api-key` header when set.
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let api_key = std::env::var("QDRANT_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            api_key,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = req
            .send()
            .await
            .with_context(|| format!("Qdrant {} request failed", what))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Qdrant {} error {}: {}", what, status, body);
        }
        Ok(response.json().await?)
    }

    fn chapter_filter(chapter_id: &str) -> Value {
        json!({
            "must": [
                { "key": "chapter_id", "match": { "value": chapter_id } }
            ]
        })
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend_name(&self) -> &str {
        "qdrant"
    }

    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        let listing = self
            .send(self.request(reqwest::Method::GET, "/collections"), "list collections")
            .await?;
        let exists = listing["result"]["collections"]
            .as_array()
            .map(|cols| cols.iter().any(|c| c["name"] == self.collection.as_str()))
            .unwrap_or(false);

        if !exists {
            tracing::info!(collection = %self.collection, dims, "creating Qdrant collection");
            let body = json!({ "vectors": { "size": dims, "distance": "Cosine" } });
            self.send(
                self.request(
                    reqwest::Method::PUT,
                    &format!("/collections/{}", self.collection),
                )
                .json(&body),
                "create collection",
            )
            .await?;
        }
        Ok(())
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }
        let count = points.len();
        let points: Vec<Value> = points
            .into_iter()
            .map(|p| {
                json!({
                    "id": p.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    "vector": p.vector,
                    "payload": p.payload,
                })
            })
            .collect();

        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("/collections/{}/points?wait=true", self.collection),
            )
            .json(&json!({ "points": points })),
            "upsert",
        )
        .await?;
        Ok(count)
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        chapter_filter: Option<&str>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(chapter) = chapter_filter {
            body["filter"] = Self::chapter_filter(chapter);
        }

        let json = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{}/points/search", self.collection),
                )
                .json(&body),
                "search",
            )
            .await?;

        parse_qdrant_hits(&json)
    }

    async fn delete_by_chapter(&self, chapter_id: &str) -> Result<()> {
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/delete?wait=true", self.collection),
            )
            .json(&json!({ "filter": Self::chapter_filter(chapter_id) })),
            "delete",
        )
        .await?;
        Ok(())
    }
}

/// Parse `POST /points/search` output. Point ids may be integers or UUIDs.
fn parse_qdrant_hits(json: &Value) -> Result<Vec<ScoredPoint>> {
    let hits = json
        .get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Invalid Qdrant response: missing result array"))?;

    Ok(hits
        .iter()
        .map(|hit| ScoredPoint {
            id: match &hit["id"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            score: hit["score"].as_f64().unwrap_or(0.0),
            payload: hit
                .get("payload")
                .cloned()
                .filter(Value::is_object)
                .unwrap_or_else(|| json!({})),
        })
        .collect())
}

// ============ SQLite ============

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Uses the `chunk_vectors` table; migrations must have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn backend_name(&self) -> &str {
        "sqlite"
    }

    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        let mismatched: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE dims != ?")
                .bind(dims as i64)
                .fetch_one(&self.pool)
                .await?;
        if mismatched > 0 {
            bail!(
                "{} stored vectors do not have {} dimensions; re-index the book",
                mismatched,
                dims
            );
        }
        Ok(())
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let count = points.len();

        for point in points {
            if point.vector.is_empty() {
                bail!("cannot store an empty vector");
            }
            let id = point
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (id, chapter_id, dims, embedding, payload_json)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    chapter_id = excluded.chapter_id,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    payload_json = excluded.payload_json
                "#,
            )
            .bind(&id)
            .bind(chapter_of(&point.payload))
            .bind(point.vector.len() as i64)
            .bind(vec_to_blob(&point.vector))
            .bind(point.payload.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(count)
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        chapter_filter: Option<&str>,
    ) -> Result<Vec<ScoredPoint>> {
        let rows = match chapter_filter {
            Some(chapter) => {
                sqlx::query(
                    "SELECT id, embedding, payload_json FROM chunk_vectors WHERE chapter_id = ?",
                )
                .bind(chapter)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT id, embedding, payload_json FROM chunk_vectors")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut hits: Vec<ScoredPoint> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let payload_json: String = row.get("payload_json");
                ScoredPoint {
                    id: row.get("id"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
                    payload: serde_json::from_str(&payload_json).unwrap_or_else(|_| json!({})),
                }
            })
            .collect();

        // Sort: score desc, id asc (deterministic)
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
        sqlx::query("DELETE FROM chunk_vectors WHERE chapter_id = ?")
            .bind(chapter_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Create the configured vector store backend.
pub fn create_vector_store(
    config: &VectorStoreConfig,
    pool: &SqlitePool,
) -> Result<Arc<dyn VectorStore>> {
    match config.backend.as_str() {
        "qdrant" => Ok(Arc::new(QdrantStore::new(config)?)),
        "sqlite" => Ok(Arc::new(SqliteVectorStore::new(pool.clone()))),
        other => bail!("Unknown vector_store backend: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubServer;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteVectorStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("v.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteVectorStore::new(pool))
    }

    fn point(id: &str, vector: Vec<f32>, chapter: &str, text: &str) -> VectorPoint {
        VectorPoint {
            id: Some(id.to_string()),
            vector,
            payload: json!({ "text": text, "chapter_id": chapter, "source": "overview.mdx" }),
        }
    }

    #[tokio::test]
    async fn test_sqlite_search_orders_by_similarity() {
        let (_tmp, store) = store().await;
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], "chapter-1", "alpha"),
                point("b", vec![0.7, 0.7], "chapter-2", "beta"),
                point("c", vec![0.0, 1.0], "chapter-2", "gamma"),
            ])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.1], 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_sqlite_chapter_filter_and_delete() {
        let (_tmp, store) = store().await;
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], "chapter-1", "alpha"),
                point("c", vec![0.0, 1.0], "chapter-2", "gamma"),
            ])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 5, Some("chapter-2")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text(), "gamma");

        store.delete_by_chapter("chapter-2").await.unwrap();
        let hits = store.search(&[1.0, 0.0], 5, Some("chapter-2")).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_upsert_replaces_and_checks_dims() {
        let (_tmp, store) = store().await;
        store
            .upsert(vec![point("a", vec![1.0, 0.0], "chapter-1", "old")])
            .await
            .unwrap();
        store
            .upsert(vec![point("a", vec![1.0, 0.0], "chapter-1", "new")])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text(), "new");

        store.ensure_collection(2).await.unwrap();
        assert!(store.ensure_collection(3).await.is_err());
    }

    #[test]
    fn test_payload_accessors_default() {
        let hit = ScoredPoint {
            id: "1".to_string(),
            score: 0.5,
            payload: json!({ "page_number": 12 }),
        };
        assert_eq!(hit.text(), "");
        assert_eq!(hit.chapter_id(), "unknown");
        assert_eq!(hit.source(), "Book Content");
        assert_eq!(hit.page_number(), "12");
    }

    #[test]
    fn test_parse_qdrant_hits() {
        let json = json!({
            "result": [
                { "id": 7, "score": 0.9, "payload": { "text": "x", "chapter_id": "chapter-4" } },
                { "id": "3f0c", "score": 0.5, "payload": null }
            ]
        });
        let hits = parse_qdrant_hits(&json).unwrap();
        assert_eq!(hits[0].id, "7");
        assert_eq!(hits[0].chapter_id(), "chapter-4");
        assert_eq!(hits[1].id, "3f0c");
        assert_eq!(hits[1].text(), "");
    }
    fn qdrant(base_url: &str, api_key: Option<&str>) -> QdrantStore {
        QdrantStore {
            base_url: base_url.to_string(),
            collection: "book_content".into(),
            api_key: api_key.map(str::to_string),
            client: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn test_qdrant_creates_missing_collection() {
        let stub = StubServer::start().await.unwrap();
        stub.push(200, json!({ "result": { "collections": [{ "name": "other" }] } }));
        stub.push(200, json!({ "result": true }));
        let store = qdrant(&stub.base_url, Some("qd-key"));

        store.ensure_collection(1024).await.unwrap();

        let requests = stub.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].path, "/collections");
        assert_eq!(requests[0].headers["api-key"], "qd-key");
        assert_eq!(requests[1].method, "PUT");
        assert_eq!(requests[1].path, "/collections/book_content");
        assert_eq!(
            requests[1].body,
            json!({ "vectors": { "size": 1024, "distance": "Cosine" } })
        );
    }

    #[tokio::test]
    async fn test_qdrant_existing_collection_is_left_alone() {
        let stub = StubServer::start().await.unwrap();
        stub.push(200, json!({ "result": { "collections": [{ "name": "book_content" }] } }));
        let store = qdrant(&stub.base_url, None);

        store.ensure_collection(1024).await.unwrap();
        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("api-key"));
    }

    #[tokio::test]
    async fn test_qdrant_search_sends_chapter_filter() {
        let stub = StubServer::start().await.unwrap();
        stub.push(
            200,
            json!({ "result": [
                { "id": 1, "score": 0.8, "payload": { "text": "t", "chapter_id": "chapter-3" } }
            ] }),
        );
        let store = qdrant(&stub.base_url, None);

        let hits = store.search(&[0.1, 0.2], 3, Some("chapter-3")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chapter_id(), "chapter-3");

        let sent = &stub.requests()[0];
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.path, "/collections/book_content/points/search");
        assert_eq!(sent.body["limit"], 3);
        assert_eq!(sent.body["with_payload"], true);
        assert_eq!(
            sent.body["filter"],
            json!({ "must": [{ "key": "chapter_id", "match": { "value": "chapter-3" } }] })
        );
    }

    #[tokio::test]
    async fn test_qdrant_search_without_filter() {
        let stub = StubServer::start().await.unwrap();
        stub.push(200, json!({ "result": [] }));
        let store = qdrant(&stub.base_url, None);

        assert!(store.search(&[0.1], 5, None).await.unwrap().is_empty());
        assert!(stub.requests()[0].body.get("filter").is_none());
    }

    #[tokio::test]
    async fn test_qdrant_upsert_payload() {
        let stub = StubServer::start().await.unwrap();
        let store = qdrant(&stub.base_url, None);

        let written = store
            .upsert(vec![
                point("p1", vec![1.0, 0.0], "chapter-1", "alpha"),
                VectorPoint {
                    id: None,
                    vector: vec![0.0, 1.0],
                    payload: json!({ "text": "beta", "chapter_id": "chapter-2" }),
                },
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let sent = &stub.requests()[0];
        assert_eq!(sent.method, "PUT");
        assert_eq!(sent.path, "/collections/book_content/points?wait=true");
        let points = sent.body["points"].as_array().unwrap();
        assert_eq!(points[0]["id"], "p1");
        assert_eq!(points[0]["payload"]["text"], "alpha");
        assert_eq!(points[1]["vector"], json!([0.0, 1.0]));
        let generated = points[1]["id"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(generated).is_ok());
    }

    #[tokio::test]
    async fn test_qdrant_delete_by_chapter_and_errors() {
        let stub = StubServer::start().await.unwrap();
        stub.push(200, json!({ "result": { "status": "completed" } }));
        stub.push(404, json!({ "status": { "error": "Not found: Collection" } }));
        let store = qdrant(&stub.base_url, None);

        store.delete_by_chapter("chapter-5").await.unwrap();
        let sent = &stub.requests()[0];
        assert_eq!(sent.path, "/collections/book_content/points/delete?wait=true");
        assert_eq!(sent.body["filter"]["must"][0]["match"]["value"], "chapter-5");

        let err = store.search(&[0.1], 1, None).await.unwrap_err();
        assert!(err.to_string().contains("Qdrant search error 404"));
    }
}
