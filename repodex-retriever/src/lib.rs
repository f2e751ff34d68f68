//! repodex-retriever: semantic indexing of source repositories
//!
//! This crate walks a repository, splits its files into chunks, embeds every chunk and keeps
//! the result in SQLite, where it can be queried by similarity and audited for integrity.
//!
//! ## Key Modules
//!
//! - **[`storage`]**: SQLite schema, per-file atomic writes and the repository registry
//! - **[`retrieval`]**: walker/classifier, chunking, the indexing engine and similarity queries
//! - **[`status`]**: orphan detection, repair and per-repository validation
//! - **[`config`]** and **[`error`]**: settings and the error taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use repodex_embed::HashEmbeddingProvider;
//! use repodex_retriever::config::RetrieverConfig;
//! use repodex_retriever::retrieval::indexing_engine::{IndexingEngine, IngestRequest};
//! use repodex_retriever::retrieval::progress::TracingObserver;
//! use repodex_retriever::retrieval::query::QueryEngine;
//! use repodex_retriever::storage::sqlite_store::IndexStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RetrieverConfig::default();
//! let store = IndexStore::open_memory().await?;
//! let provider = Arc::new(HashEmbeddingProvider::new(256)?);
//!
//! let engine = IndexingEngine::new(store.clone(), provider.clone(), &config);
//! let summary = engine
//!     .ingest(IngestRequest::new("."), &TracingObserver)
//!     .await?;
//! println!("indexed {} chunks", summary.total_chunks);
//!
//! let queries = QueryEngine::new(store, provider, config.query.clone());
//! for result in queries.query("open a database pool", ".", Some(3)).await? {
//!     println!("{:.3} {}:{}", result.score, result.file_path, result.line_start + 1);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! RepositoryWalker → chunk_text → EmbeddingProvider → IndexStore (SQLite)
//!                    IndexingEngine drives each file      ↓
//!                                       QueryEngine ← HealthChecker
//! ```

pub mod config;
pub mod error;
pub mod retrieval;
pub mod status;
pub mod storage;

pub use error::{ErrorKind, Result, RetrieverError};
