//! Similarity queries over one repository's chunks.
//!
//! The query text is embedded with the same provider used for ingestion, then compared by
//! cosine similarity against every embedding of the active model version in the repository.
//! Results are ordered by descending score; ties break by ascending chunk index and then by
//! ascending file path, so the same index always answers the same query the same way.

use crate::config::QueryConfig;
use crate::error::{Result, RetrieverError, with_timeout};
use crate::storage::registry::RepositoryRegistry;
use crate::storage::sqlite_store::IndexStore;
use crate::storage::{ChunkId, FileType, blob_to_vector};
use half::f16;
use itertools::Itertools;
use repodex_embed::EmbeddingProvider;
use serde::Serialize;
use sqlx::Row;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// One ranked chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub file_type: FileType,
    pub language: Option<String>,
    pub chunk_index: usize,
    pub content: String,
    pub line_start: usize,
    pub line_end: usize,
    /// Cosine similarity with the query, in [-1, 1]
    pub score: f32,
}

/// Cosine similarity of two vectors. Zero when either has no length.
pub fn cosine_similarity(a: &[f16], b: &[f16]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (x.to_f32(), y.to_f32());
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

fn rank(a: &QueryResult, b: &QueryResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.chunk_index.cmp(&b.chunk_index))
        .then_with(|| a.file_path.cmp(&b.file_path))
}

pub struct QueryEngine {
    store: IndexStore,
    registry: RepositoryRegistry,
    provider: Arc<dyn EmbeddingProvider>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(
        store: IndexStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: QueryConfig,
    ) -> Self {
        Self {
            registry: RepositoryRegistry::new(store.clone()),
            store,
            provider,
            config,
        }
    }

    /// Rank the chunks of `repository` (a name, path or id) against `text`.
    ///
    /// `limit` defaults to the configured default when `None`; zero or negative limits are
    /// rejected, as are empty query texts and repository keys.
    pub async fn query(
        &self,
        text: &str,
        repository: &str,
        limit: Option<i64>,
    ) -> Result<Vec<QueryResult>> {
        if text.trim().is_empty() {
            return Err(RetrieverError::invalid_params("text", "must not be empty"));
        }
        if repository.trim().is_empty() {
            return Err(RetrieverError::invalid_params(
                "repository",
                "must not be empty",
            ));
        }
        let limit = match limit {
            None => self.config.default_limit,
            Some(n) if n > 0 => n as usize,
            Some(n) => {
                return Err(RetrieverError::invalid_params(
                    "limit",
                    format!("must be a positive integer, got {n}"),
                ));
            }
        };

        with_timeout("query", self.config.timeout(), async {
            let repository = self.registry.require(repository).await?;
            let query_vector = self.provider.embed_text(text).await?;
            self.rank_chunks(&repository.id, &query_vector, limit).await
        })
        .await
    }

    async fn rank_chunks(
        &self,
        repository_id: &str,
        query_vector: &[f16],
        limit: usize,
    ) -> Result<Vec<QueryResult>> {
        let model_version = self.provider.model_version();
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.chunk_index, c.content, c.line_start, c.line_end,
                   f.file_path, f.file_type, f.language, e.vector
            FROM embeddings e
            JOIN chunks c ON c.id = e.chunk_id
            JOIN files f ON f.id = c.file_id
            WHERE f.repository_id = ?1
              AND e.model_version = ?2
              AND f.file_type != 'binary'
            "#,
        )
        .bind(repository_id)
        .bind(&model_version)
        .fetch_all(self.store.pool())
        .await?;

        let mut skipped = 0;
        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let vector = blob_to_vector(&row.try_get::<Vec<u8>, _>("vector")?);
            if vector.len() != query_vector.len() {
                skipped += 1;
                continue;
            }

            let file_type: String = row.try_get("file_type")?;
            scored.push(QueryResult {
                chunk_id: row.try_get("chunk_id")?,
                file_path: row.try_get("file_path")?,
                file_type: file_type
                    .parse()
                    .map_err(RetrieverError::IntegrityViolation)?,
                language: row.try_get("language")?,
                chunk_index: row.try_get::<i64, _>("chunk_index")? as usize,
                content: row.try_get("content")?,
                line_start: row.try_get::<i64, _>("line_start")? as usize,
                line_end: row.try_get::<i64, _>("line_end")? as usize,
                score: cosine_similarity(query_vector, &vector),
            });
        }

        if skipped > 0 {
            warn!(
                "Skipped {} embeddings whose dimension differs from the query ({})",
                skipped,
                query_vector.len()
            );
        }
        debug!("Scored {} chunks for repository {}", scored.len(), repository_id);

        Ok(scored.into_iter().sorted_by(rank).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::retrieval::chunking_strategy::{ChunkingConfig, chunk_text};
    use crate::storage::sqlite_store::FileWrite;
    use crate::storage::sqlite_store::tests::insert_repository;
    use async_trait::async_trait;
    use repodex_embed::{EmbedError, EmbeddingResult, HashEmbeddingProvider};

    const DIM: usize = 64;

    async fn write_file(
        store: &IndexStore,
        provider: &HashEmbeddingProvider,
        repository_id: &str,
        path: &str,
        file_type: FileType,
        content: &str,
    ) -> Result<()> {
        let chunks = if file_type.is_indexable() {
            chunk_text(content, &ChunkingConfig::lines(2))
        } else {
            Vec::new()
        };
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = provider.embed_texts(&texts).await?.embeddings;
        store
            .replace_file(
                repository_id,
                &FileWrite {
                    file_path: path.to_string(),
                    file_type,
                    language: None,
                    size_bytes: content.len() as u64,
                    modified_at: 0,
                    content_hash: String::new(),
                    chunks,
                    embeddings,
                    model_version: provider.model_version(),
                },
            )
            .await?;
        Ok(())
    }

    async fn setup() -> Result<(IndexStore, QueryEngine)> {
        let store = IndexStore::open_memory().await?;
        let provider = HashEmbeddingProvider::new(DIM)?;
        insert_repository(&store, "r1", "alpha").await?;
        insert_repository(&store, "r2", "beta").await?;

        write_file(
            &store,
            &provider,
            "r1",
            "/alpha/pool.rs",
            FileType::Code,
            "fn open_pool() {}\nlet pool = connect();\nfn render_frame() {}\nshader.bind();\n",
        )
        .await?;
        write_file(
            &store,
            &provider,
            "r1",
            "/alpha/notes.md",
            FileType::Text,
            "database connection pool notes\n",
        )
        .await?;
        write_file(&store, &provider, "r1", "/alpha/logo.png", FileType::Binary, "").await?;
        write_file(
            &store,
            &provider,
            "r2",
            "/beta/other.rs",
            FileType::Code,
            "fn open_pool() {}\nlet pool = connect();\n",
        )
        .await?;

        let engine = QueryEngine::new(store.clone(), Arc::new(provider), QueryConfig::default());
        Ok((store, engine))
    }

    #[test]
    fn test_cosine_similarity() {
        let v = |xs: &[f32]| xs.iter().map(|x| f16::from_f32(*x)).collect::<Vec<_>>();
        assert!((cosine_similarity(&v(&[1.0, 2.0]), &v(&[2.0, 4.0])) - 1.0).abs() < 1e-3);
        assert!((cosine_similarity(&v(&[1.0, 0.0]), &v(&[-1.0, 0.0])) + 1.0).abs() < 1e-3);
        assert_eq!(cosine_similarity(&v(&[1.0, 0.0]), &v(&[0.0, 1.0])), 0.0);
        assert_eq!(cosine_similarity(&v(&[0.0, 0.0]), &v(&[1.0, 1.0])), 0.0);
    }

    #[tokio::test]
    async fn test_exact_chunk_text_ranks_first() -> Result<()> {
        let (_store, engine) = setup().await?;
        let results = engine
            .query("fn render_frame() {}\nshader.bind();\n", "alpha", Some(1))
            .await?;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_path, "/alpha/pool.rs");
        assert_eq!(results[0].chunk_index, 1);
        assert!((results[0].score - 1.0).abs() < 1e-2);
        Ok(())
    }

    #[tokio::test]
    async fn test_results_scoped_and_ordered() -> Result<()> {
        let (_store, engine) = setup().await?;
        let results = engine.query("database connection pool", "alpha", None).await?;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.file_path.starts_with("/alpha/")));
        assert!(results.iter().all(|r| r.file_type != FileType::Binary));
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(results[0].file_path, "/alpha/notes.md");
        Ok(())
    }

    #[test]
    fn test_ties_break_by_chunk_index_then_path() {
        let result = |path: &str, chunk_index: usize, score: f32| QueryResult {
            chunk_id: 0,
            file_path: path.to_string(),
            file_type: FileType::Code,
            language: None,
            chunk_index,
            content: String::new(),
            line_start: 0,
            line_end: 0,
            score,
        };
        let ranked: Vec<(String, usize)> = vec![
            result("b.rs", 0, 0.5),
            result("a.rs", 1, 0.5),
            result("a.rs", 0, 0.5),
            result("z.rs", 3, 0.9),
        ]
        .into_iter()
        .sorted_by(rank)
        .map(|r| (r.file_path, r.chunk_index))
        .collect();

        assert_eq!(
            ranked,
            vec![
                ("z.rs".to_string(), 3),
                ("a.rs".to_string(), 0),
                ("b.rs".to_string(), 0),
                ("a.rs".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_limit_validation() -> Result<()> {
        let (_store, engine) = setup().await?;

        for bad in [0, -3] {
            let err = engine.query("pool", "alpha", Some(bad)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParams);
        }
        assert_eq!(engine.query("pool", "alpha", Some(2)).await?.len(), 2);

        let err = engine.query("   ", "alpha", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        let err = engine.query("pool", "", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_repository() -> Result<()> {
        let (_store, engine) = setup().await?;
        let err = engine.query("pool", "gamma", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_other_model_versions_ignored() -> Result<()> {
        let (store, _engine) = setup().await?;
        let other = QueryEngine::new(
            store,
            Arc::new(HashEmbeddingProvider::new(DIM / 2)?),
            QueryConfig::default(),
        );
        // Same repository, but nothing was embedded with this model.
        assert!(other.query("pool", "alpha", None).await?.is_empty());
        Ok(())
    }

    struct Unloadable;

    #[async_trait]
    impl EmbeddingProvider for Unloadable {
        async fn embed_texts(&self, _texts: &[String]) -> repodex_embed::Result<EmbeddingResult> {
            Err(EmbedError::ModelInitialization {
                attempts: 1,
                source: "no weights".into(),
            })
        }

        fn embedding_dimension(&self) -> usize {
            DIM
        }

        fn provider_name(&self) -> &str {
            "unloadable"
        }

        fn model_version(&self) -> String {
            "unloadable:v1".to_string()
        }
    }

    #[tokio::test]
    async fn test_model_failure_is_dependency_failure() -> Result<()> {
        let (store, _engine) = setup().await?;
        let engine = QueryEngine::new(store.clone(), Arc::new(Unloadable), QueryConfig::default());

        let err = engine.query("pool", "alpha", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyFailure);

        // Listing does not need the model.
        assert_eq!(RepositoryRegistry::new(store).list().await?.len(), 2);
        Ok(())
    }
}
