//! Shared service handles.
//!
//! [`AppContext`] bundles configuration, the SQLite pool, and the three
//! remote backends (embedder, vector store, chat model). It is cheap to
//! clone and is passed to every service function and HTTP handler.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::book::Catalog;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::llm::{ChatModel, OpenAiCompatClient};
use crate::tools::ToolRegistry;
use crate::vector_store::{self, VectorStore};
use crate::{db, migrate};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub vectors: Arc<dyn VectorStore>,
    pub llm: Arc<dyn ChatModel>,
    pub catalog: Arc<Catalog>,
    pub tools: Arc<ToolRegistry>,
}

impl AppContext {
    /// Assemble a context from already-built parts. Used by tests to swap in
    /// fake backends.
    pub fn new(
        config: Config,
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn ChatModel>,
    ) -> Self {
        let catalog = Arc::new(Catalog::from_config(&config.book));
        Self {
            config: Arc::new(config),
            pool,
            embedder,
            vectors,
            llm,
            catalog,
            tools: Arc::new(ToolRegistry::with_builtins()),
        }
    }

    /// Connect to the database, run migrations, and build the configured
    /// providers.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;

        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::from(embedding::create_provider(&config.embedding)?);
        let vectors = vector_store::create_vector_store(&config.vector_store, &pool)?;
        let llm: Arc<dyn ChatModel> = Arc::new(OpenAiCompatClient::from_config(&config.llm)?);

        tracing::info!(
            db = %config.db.path.display(),
            embedding = embedder.model_name(),
            vector_store = vectors.backend_name(),
            model = llm.model_name(),
            "services ready"
        );

        Ok(Self::new(config, pool, embedder, vectors, llm))
    }
}
