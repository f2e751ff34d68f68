//! Ingestion: turning a repository's files into chunks and embeddings.
//!
//! ## Pipeline Flow
//!
//! ```text
//! RepositoryWalker → (flume channel) → workers → Chunker → EmbeddingProvider → IndexStore
//!   blocking thread                    max_workers files at a time      one transaction per file
//! ```
//!
//! Each file ends in exactly one of three states:
//! - **done**: its chunks and embeddings were written, replacing anything stored before
//! - **skipped**: the stored record already matches the file (size and modification time, or
//!   content hash) and every chunk has an embedding for the active model
//! - **failed**: something went wrong; nothing partial was written and the run moves on
//!
//! A failure to load the embedding model is different: no further file can succeed, so the
//! run stops issuing work and returns the error.
//!
//! After a complete walk, records of files that no longer exist are pruned.

use super::analyzer::{FileDescriptor, RepositoryWalker, describe_file};
use super::chunking_strategy::ChunkingStrategy;
use super::progress::IngestObserver;
use crate::config::{IngestConfig, RetrieverConfig};
use crate::error::{ErrorKind, Result, RetrieverError, with_timeout};
use crate::storage::registry::{RepositoryRegistry, normalize_path};
use crate::storage::sqlite_store::{FileWrite, IndexStore};
use crate::storage::{FileType, Repository};
use futures::StreamExt;
use repodex_embed::{EmbedError, EmbeddingProvider};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What to ingest
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    /// Repository root directory
    pub path: PathBuf,
    /// Name used when the repository is registered for the first time. Defaults to the
    /// directory name.
    pub name: Option<String>,
    /// Metadata merged into the repository record
    pub metadata: Map<String, Value>,
}

impl IngestRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of processing one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Done { chunks: usize },
    Skipped,
    /// The file no longer exists and its records were removed
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

/// Totals of one ingestion run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub repository_id: String,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub files_removed: usize,
    /// Chunks written by this run
    pub total_chunks: usize,
    pub duration: Duration,
    pub cancelled: bool,
    pub failures: Vec<FileFailure>,
}

/// Stops an ingestion run from issuing new file work. Files already being processed finish.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives walking, chunking, embedding and persistence for repositories.
pub struct IndexingEngine {
    store: IndexStore,
    registry: RepositoryRegistry,
    provider: Arc<dyn EmbeddingProvider>,
    chunking_strategy: ChunkingStrategy,
    config: IngestConfig,
    cancel: CancelHandle,
}

impl IndexingEngine {
    pub fn new(
        store: IndexStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: &RetrieverConfig,
    ) -> Self {
        let mut ingest = config.ingest.clone();
        ingest.max_workers = ingest.max_workers.max(1);
        Self {
            registry: RepositoryRegistry::new(store.clone()),
            store,
            provider,
            chunking_strategy: ChunkingStrategy::new(config.chunking.clone()),
            config: ingest,
            cancel: CancelHandle::default(),
        }
    }

    pub fn registry(&self) -> &RepositoryRegistry {
        &self.registry
    }

    /// Handle that cancels the run in progress
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Ingest a repository, registering it on first use.
    pub async fn ingest(
        &self,
        request: IngestRequest,
        observer: &dyn IngestObserver,
    ) -> Result<SessionSummary> {
        let started = Instant::now();
        self.cancel.reset();

        let repository = self.find_or_register(&request).await?;
        observer.on_session_start(&repository);

        let model_version = self.provider.model_version();
        let mut summary = SessionSummary {
            repository_id: repository.id.clone(),
            ..SessionSummary::default()
        };

        let (tx, rx) = flume::bounded::<Result<FileDescriptor>>(self.config.max_workers * 4);
        let walker = RepositoryWalker::new(repository.path.clone(), &self.config);
        let cancel = self.cancel.clone();
        let walk = tokio::task::spawn_blocking(move || {
            for item in walker.walk() {
                if cancel.is_cancelled() || tx.send(item).is_err() {
                    return false;
                }
            }
            true
        });

        let mut results = rx
            .into_stream()
            .map(|item| self.run_file(&repository.id, item, &model_version, observer))
            .buffer_unordered(self.config.max_workers);

        let mut seen = HashSet::new();
        let mut walk_errors = 0;
        let mut fatal = None;

        while let Some(result) = results.next().await {
            let Some((path, outcome)) = result else {
                continue;
            };
            match outcome {
                Ok(FileOutcome::Done { chunks }) => {
                    summary.files_processed += 1;
                    summary.total_chunks += chunks;
                }
                Ok(FileOutcome::Skipped) => summary.files_skipped += 1,
                Ok(FileOutcome::Removed) => summary.files_removed += 1,
                Err(error) => {
                    summary.files_failed += 1;
                    summary.failures.push(FileFailure {
                        path: path.clone().unwrap_or_else(|| repository.path.clone()),
                        kind: error.kind(),
                        message: error.to_string(),
                    });
                    if path.is_none() {
                        walk_errors += 1;
                    } else if is_load_failure(&error) && fatal.is_none() {
                        warn!("Embedding model unavailable, stopping ingestion: {}", error);
                        self.cancel.cancel();
                        fatal = Some(error);
                    }
                }
            }
            if let Some(path) = path {
                seen.insert(path.to_string_lossy().into_owned());
            }
        }
        drop(results);

        let walk_complete = walk
            .await
            .map_err(|e| RetrieverError::Io(std::io::Error::other(e)))?;
        summary.cancelled = self.cancel.is_cancelled();

        if let Some(error) = fatal {
            summary.duration = started.elapsed();
            observer.on_session_complete(&summary);
            return Err(error);
        }

        if walk_complete && !summary.cancelled && walk_errors == 0 && self.config.prune_missing {
            summary.files_removed += self.prune_missing(&repository.id, &seen).await?;
        }

        self.registry.touch_ingested(&repository.id).await?;
        summary.duration = started.elapsed();
        observer.on_session_complete(&summary);
        Ok(summary)
    }

    /// Re-ingest one file of an already registered repository. A path that no longer exists
    /// has its records removed.
    pub async fn ingest_file(&self, repository: &Repository, path: &Path) -> Result<FileOutcome> {
        let path = normalize_path(path);
        if !path.starts_with(&repository.path) {
            return Err(RetrieverError::invalid_params(
                "path",
                format!(
                    "{} is not inside repository {}",
                    path.display(),
                    repository.path.display()
                ),
            ));
        }

        let walker = RepositoryWalker::new(repository.path.clone(), &self.config);
        if walker.is_excluded(&path) {
            return Err(RetrieverError::invalid_params(
                "path",
                format!("{} is excluded from indexing", path.display()),
            ));
        }

        if !path.exists() {
            let key = path.to_string_lossy().into_owned();
            let removed = self.store.remove_files(&repository.id, &[key]).await?;
            return if removed > 0 {
                Ok(FileOutcome::Removed)
            } else {
                Err(RetrieverError::not_found("file", path.display().to_string()))
            };
        }

        let descriptor = describe_file(&repository.path, &path)?;
        if descriptor.size_bytes > self.config.max_file_bytes {
            return Err(RetrieverError::invalid_params(
                "path",
                format!(
                    "{} is larger than {} bytes",
                    path.display(),
                    self.config.max_file_bytes
                ),
            ));
        }
        self.process_file(&repository.id, &descriptor, &self.provider.model_version())
            .await
    }

    async fn find_or_register(&self, request: &IngestRequest) -> Result<Repository> {
        if request.path.as_os_str().is_empty() {
            return Err(RetrieverError::invalid_params("path", "must not be empty"));
        }
        if !request.path.is_dir() {
            return Err(RetrieverError::invalid_params(
                "path",
                format!("{} is not a directory", request.path.display()),
            ));
        }

        let root = normalize_path(&request.path);
        if let Some(existing) = self.registry.get_by_path(&root).await? {
            debug!("Found registered repository {} for {}", existing.name, root.display());
            if request.metadata.is_empty() {
                return Ok(existing);
            }
            return self
                .registry
                .update(&existing.id, request.metadata.clone())
                .await;
        }

        let name = match &request.name {
            Some(name) => name.clone(),
            None => root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| root.to_string_lossy().into_owned()),
        };
        self.registry
            .create(&name, &root, request.metadata.clone())
            .await
    }

    /// Process one walker item, reporting to the observer. `None` when the run was cancelled
    /// before the file was started.
    async fn run_file(
        &self,
        repository_id: &str,
        item: Result<FileDescriptor>,
        model_version: &str,
        observer: &dyn IngestObserver,
    ) -> Option<(Option<PathBuf>, Result<FileOutcome>)> {
        let descriptor = match item {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Error while walking repository: {}", e);
                return Some((None, Err(e)));
            }
        };
        if self.cancel.is_cancelled() {
            return None;
        }

        let path = descriptor.path.clone();
        let started = Instant::now();
        observer.on_file_start(&path);

        let outcome = self
            .process_file(repository_id, &descriptor, model_version)
            .await;
        match &outcome {
            Ok(FileOutcome::Done { chunks }) => {
                observer.on_file_done(&path, *chunks, started.elapsed())
            }
            Ok(FileOutcome::Skipped) => observer.on_file_skipped(&path),
            Ok(FileOutcome::Removed) => {}
            Err(e) => observer.on_file_error(&path, e),
        }
        Some((Some(path), outcome))
    }

    async fn process_file(
        &self,
        repository_id: &str,
        descriptor: &FileDescriptor,
        model_version: &str,
    ) -> Result<FileOutcome> {
        let store_timeout = self.config.store_timeout();
        let file_path = descriptor.path.to_string_lossy().into_owned();

        let existing = with_timeout(
            "store lookup",
            store_timeout,
            self.store.get_file(repository_id, &file_path),
        )
        .await?;

        let embedded = match &existing {
            Some(record) => {
                with_timeout(
                    "store lookup",
                    store_timeout,
                    self.store.unembedded_chunks(record.id, model_version),
                )
                .await?
                    == 0
            }
            None => false,
        };

        // The stored type may differ from the walker's guess when invalid UTF-8 shows up
        // past the sniffed prefix, so only size, time and content decide a skip.
        if let Some(record) = existing.as_ref().filter(|_| embedded) {
            if record.size_bytes == descriptor.size_bytes
                && record.modified_at == descriptor.modified_at
            {
                return Ok(FileOutcome::Skipped);
            }
        }

        let bytes = with_timeout("file read", store_timeout, async {
            tokio::fs::read(&descriptor.path)
                .await
                .map_err(RetrieverError::from)
        })
        .await?;
        let content_hash = blake3::hash(&bytes).to_hex().to_string();

        if let Some(record) = existing.as_ref().filter(|_| embedded) {
            if record.content_hash == content_hash {
                debug!("Content of {} unchanged, refreshing modification time", file_path);
                with_timeout(
                    "store write",
                    store_timeout,
                    self.store.touch_file(record.id, descriptor.modified_at),
                )
                .await?;
                return Ok(FileOutcome::Skipped);
            }
        }

        let mut file_type = descriptor.file_type;
        let content = match file_type {
            FileType::Binary => None,
            _ => match String::from_utf8(bytes) {
                Ok(content) => Some(content),
                Err(_) => {
                    debug!("{} is not valid UTF-8, treating as binary", file_path);
                    file_type = FileType::Binary;
                    None
                }
            },
        };
        let chunks = content
            .map(|c| self.chunking_strategy.chunk_content(&c))
            .unwrap_or_default();

        let embeddings = if chunks.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let result = with_timeout("embedding", self.config.embed_timeout(), async {
                self.provider
                    .embed_texts(&texts)
                    .await
                    .map_err(RetrieverError::from)
            })
            .await?;
            self.check_embeddings(&result.embeddings, chunks.len())?;
            result.embeddings
        };

        let write = FileWrite {
            file_path,
            file_type,
            language: descriptor.language.clone(),
            size_bytes: descriptor.size_bytes,
            modified_at: descriptor.modified_at,
            content_hash,
            chunks,
            embeddings,
            model_version: model_version.to_string(),
        };
        with_timeout(
            "store write",
            store_timeout,
            self.store.replace_file(repository_id, &write),
        )
        .await?;

        Ok(FileOutcome::Done {
            chunks: write.chunks.len(),
        })
    }

    fn check_embeddings(&self, embeddings: &[Vec<half::f16>], expected: usize) -> Result<()> {
        if embeddings.len() != expected {
            return Err(EmbedError::embedding_gen(format!(
                "expected {expected} embeddings, got {}",
                embeddings.len()
            ))
            .into());
        }
        let dimension = self.provider.embedding_dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
            return Err(EmbedError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            }
            .into());
        }
        Ok(())
    }

    async fn prune_missing(&self, repository_id: &str, seen: &HashSet<String>) -> Result<usize> {
        let missing: Vec<String> = self
            .store
            .list_files(repository_id)
            .await?
            .into_iter()
            .map(|f| f.file_path)
            .filter(|p| !seen.contains(p))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let removed = self.store.remove_files(repository_id, &missing).await?;
        info!("Pruned {} files that are no longer in the repository", removed);
        Ok(removed as usize)
    }
}

fn is_load_failure(error: &RetrieverError) -> bool {
    matches!(error, RetrieverError::DependencyFailure(e) if e.is_load_failure())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::chunking_strategy::ChunkingConfig;
    use crate::retrieval::progress::NoopObserver;
    use async_trait::async_trait;
    use repodex_embed::{EmbeddingResult, HashEmbeddingProvider};
    use std::fs;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    const DIM: usize = 32;

    /// Hash embeddings, with configurable misbehaviour.
    struct TestProvider {
        inner: HashEmbeddingProvider,
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
        wrong_dimension: bool,
        delay: Duration,
    }

    impl TestProvider {
        fn new() -> Self {
            Self {
                inner: HashEmbeddingProvider::new(DIM).unwrap(),
                calls: AtomicUsize::new(0),
                fail_on: None,
                wrong_dimension: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for TestProvider {
        async fn embed_texts(&self, texts: &[String]) -> repodex_embed::Result<EmbeddingResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(marker) = self.fail_on {
                if texts.iter().any(|t| t.contains(marker)) {
                    return Err(EmbedError::embedding_gen("refusing marked text"));
                }
            }
            let mut result = self.inner.embed_texts(texts).await?;
            if self.wrong_dimension {
                result.embeddings[0].pop();
            }
            Ok(result)
        }

        fn embedding_dimension(&self) -> usize {
            DIM
        }

        fn provider_name(&self) -> &str {
            "test"
        }

        fn model_version(&self) -> String {
            self.inner.model_version()
        }
    }

    /// A provider whose model never loads.
    struct BrokenProvider;

    #[async_trait]
    impl EmbeddingProvider for BrokenProvider {
        async fn embed_texts(&self, _texts: &[String]) -> repodex_embed::Result<EmbeddingResult> {
            Err(EmbedError::ModelInitialization {
                attempts: 3,
                source: "weights unavailable".into(),
            })
        }

        fn embedding_dimension(&self) -> usize {
            DIM
        }

        fn provider_name(&self) -> &str {
            "broken"
        }

        fn model_version(&self) -> String {
            "broken:v1".to_string()
        }
    }

    fn config() -> RetrieverConfig {
        RetrieverConfig {
            chunking: ChunkingConfig::lines(10),
            ..RetrieverConfig::default()
        }
    }

    async fn engine_with(
        provider: Arc<dyn EmbeddingProvider>,
        config: &RetrieverConfig,
    ) -> Result<IndexingEngine> {
        Ok(IndexingEngine::new(
            IndexStore::open_memory().await?,
            provider,
            config,
        ))
    }

    fn lines(n: usize, prefix: &str) -> String {
        (0..n).map(|i| format!("{prefix} line {i}\n")).collect()
    }

    #[tokio::test]
    async fn test_ingest_and_skip_unchanged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.rs"), lines(25, "a"))?;
        fs::write(dir.path().join("b.py"), lines(3, "b"))?;

        let provider = Arc::new(TestProvider::new());
        let engine = engine_with(provider.clone(), &config()).await?;

        let first = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;
        assert_eq!(first.files_processed, 2);
        assert_eq!(first.total_chunks, 4);
        assert_eq!(first.files_failed, 0);
        let calls = provider.calls.load(Ordering::SeqCst);

        let second = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;
        assert_eq!(second.files_processed, 0);
        assert_eq!(second.files_skipped, 2);
        assert_eq!(second.repository_id, first.repository_id);
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls);

        let repo = engine.registry().require(&first.repository_id).await?;
        assert!(repo.last_ingested_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_touched_but_identical_file_is_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.rs");
        fs::write(&path, lines(5, "a"))?;

        let engine = engine_with(Arc::new(TestProvider::new()), &config()).await?;
        let first = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;

        let file = fs::File::options().write(true).open(&path)?;
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(60))?;
        drop(file);

        let second = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;
        assert_eq!(second.files_skipped, 1);

        let store = &engine.store;
        let record = store
            .list_files(&first.repository_id)
            .await?
            .pop()
            .unwrap();
        assert_eq!(
            record.modified_at,
            crate::retrieval::analyzer::modified_millis(&fs::metadata(&path)?)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_late_invalid_utf8_file_is_skipped_when_unchanged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut content = "a".repeat(10_000).into_bytes();
        content.extend_from_slice(b"\n\xff\n");
        fs::write(dir.path().join("data.txt"), content)?;

        let provider = Arc::new(TestProvider::new());
        let engine = engine_with(provider.clone(), &config()).await?;
        let first = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;
        assert_eq!(first.files_processed, 1);
        assert_eq!(first.total_chunks, 0);

        for _ in 0..2 {
            let again = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;
            assert_eq!(again.files_processed, 0);
            assert_eq!(again.files_skipped, 1);
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        let record = engine
            .store
            .list_files(&first.repository_id)
            .await?
            .pop()
            .unwrap();
        assert_eq!(record.file_type, FileType::Binary);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_workers_still_finishes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.rs"), lines(5, "a"))?;

        let mut config = config();
        config.ingest = config.ingest.with_max_workers(0);
        let engine = engine_with(Arc::new(TestProvider::new()), &config).await?;
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            engine.ingest(IngestRequest::new(dir.path()), &NoopObserver),
        )
        .await
        .expect("ingest with zero workers hung")?;

        assert_eq!(summary.files_processed, 1);
        assert_eq!(summary.total_chunks, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_file_does_not_stop_run() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("good.rs"), lines(5, "good"))?;
        fs::write(dir.path().join("bad.rs"), lines(5, "POISON"))?;

        let provider = TestProvider {
            fail_on: Some("POISON"),
            ..TestProvider::new()
        };
        let engine = engine_with(Arc::new(provider), &config()).await?;
        let summary = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;

        assert_eq!(summary.files_processed, 1);
        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.failures[0].kind, ErrorKind::DependencyFailure);
        assert!(summary.failures[0].path.ends_with("bad.rs"));

        let files = engine.store.list_files(&summary.repository_id).await?;
        assert_eq!(files.len(), 1);
        assert!(files[0].file_path.ends_with("good.rs"));
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_dimension_fails_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.rs"), lines(5, "a"))?;

        let provider = TestProvider {
            wrong_dimension: true,
            ..TestProvider::new()
        };
        let engine = engine_with(Arc::new(provider), &config()).await?;
        let summary = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;

        assert_eq!(summary.files_failed, 1);
        assert!(summary.failures[0].message.contains("dimension mismatch"));
        assert_eq!(engine.store.index_stats().await?.chunks, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_embedding_timeout_fails_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.rs"), lines(5, "a"))?;

        let provider = TestProvider {
            delay: Duration::from_secs(5),
            ..TestProvider::new()
        };
        let mut config = config();
        config.ingest = config.ingest.with_embed_timeout(Duration::from_millis(20));
        let engine = engine_with(Arc::new(provider), &config).await?;
        let summary = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;

        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.failures[0].kind, ErrorKind::Timeout);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_failure_stops_run() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for i in 0..5 {
            fs::write(dir.path().join(format!("f{i}.rs")), lines(3, "x"))?;
        }

        let mut config = config();
        config.ingest = config.ingest.with_max_workers(1);
        let engine = engine_with(Arc::new(BrokenProvider), &config).await?;
        let err = engine
            .ingest(IngestRequest::new(dir.path()), &NoopObserver)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyFailure);

        // Unrelated operations keep working.
        assert_eq!(engine.registry().list().await?.len(), 1);
        assert_eq!(engine.store.index_stats().await?.files, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_prunes_deleted_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("keep.rs"), lines(3, "k"))?;
        fs::write(dir.path().join("gone.rs"), lines(3, "g"))?;

        let engine = engine_with(Arc::new(TestProvider::new()), &config()).await?;
        engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;

        fs::remove_file(dir.path().join("gone.rs"))?;
        let summary = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;
        assert_eq!(summary.files_removed, 1);
        assert_eq!(engine.store.index_stats().await?.files, 1);
        Ok(())
    }

    struct CancelAfterFirst {
        handle: CancelHandle,
        done: Mutex<Vec<PathBuf>>,
    }

    impl IngestObserver for CancelAfterFirst {
        fn on_file_done(&self, path: &Path, _chunks: usize, _elapsed: Duration) {
            self.done.lock().unwrap().push(path.to_path_buf());
            self.handle.cancel();
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_new_work() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for i in 0..20 {
            fs::write(dir.path().join(format!("f{i:02}.rs")), lines(3, "x"))?;
        }

        let mut config = config();
        config.ingest = config.ingest.with_max_workers(1);
        let engine = engine_with(Arc::new(TestProvider::new()), &config).await?;
        let observer = CancelAfterFirst {
            handle: engine.cancel_handle(),
            done: Mutex::new(Vec::new()),
        };

        let summary = engine.ingest(IngestRequest::new(dir.path()), &observer).await?;
        assert!(summary.cancelled);
        assert_eq!(summary.files_processed, 1);
        assert_eq!(observer.done.lock().unwrap().len(), 1);
        assert_eq!(engine.store.index_stats().await?.files, 1);

        // A new run starts uncancelled and picks up the rest.
        let summary = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;
        assert!(!summary.cancelled);
        assert_eq!(summary.files_processed, 19);
        assert_eq!(summary.files_skipped, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_ingest_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.rs");
        fs::write(&path, lines(3, "a"))?;

        let engine = engine_with(Arc::new(TestProvider::new()), &config()).await?;
        let summary = engine.ingest(IngestRequest::new(dir.path()), &NoopObserver).await?;
        let repo = engine.registry().require(&summary.repository_id).await?;

        fs::write(&path, lines(30, "a"))?;
        assert_eq!(
            engine.ingest_file(&repo, &path).await?,
            FileOutcome::Done { chunks: 3 }
        );
        assert_eq!(engine.ingest_file(&repo, &path).await?, FileOutcome::Skipped);

        fs::remove_file(&path)?;
        assert_eq!(engine.ingest_file(&repo, &path).await?, FileOutcome::Removed);

        let outside = tempfile::tempdir()?;
        let err = engine
            .ingest_file(&repo, &outside.path().join("x.rs"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_missing_directory() -> Result<()> {
        let engine = engine_with(Arc::new(TestProvider::new()), &config()).await?;
        let err = engine
            .ingest(IngestRequest::new("/definitely/not/here"), &NoopObserver)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        assert!(engine.registry().list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_name_and_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = engine_with(Arc::new(TestProvider::new()), &config()).await?;

        let mut metadata = Map::new();
        metadata.insert("owner".to_string(), Value::from("search"));
        let summary = engine
            .ingest(
                IngestRequest::new(dir.path())
                    .with_name("my-repo")
                    .with_metadata(metadata),
                &NoopObserver,
            )
            .await?;

        let repo = engine.registry().require("my-repo").await?;
        assert_eq!(repo.id, summary.repository_id);
        assert_eq!(repo.metadata["owner"], "search");
        assert_eq!(summary.files_processed, 0);
        Ok(())
    }
}
