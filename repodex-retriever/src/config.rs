//! Configuration for repodex.
//!
//! Settings are read from a TOML file. Every field has a default, so an empty or partial
//! file is valid:
//!
//! ```toml
//! [storage]
//! database_path = ".repodex/index.db"
//!
//! [chunking]
//! unit = "lines"
//! max_chunk_size = 100
//! overlap = 5
//!
//! [ingest]
//! max_workers = 8
//!
//! [query]
//! default_limit = 5
//!
//! [embedding]
//! model_name = "bge-small-en-v1.5"
//! ```

use crate::error::{Result, RetrieverError};
use crate::retrieval::chunking_strategy::{ChunkUnit, ChunkingConfig};
use repodex_embed::EmbedConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the directory repodex keeps inside an indexed repository. Never walked.
pub const INDEX_DIR_NAME: &str = ".repodex";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    pub ingest: IngestConfig,
    pub query: QueryConfig,
    pub embedding: EmbedConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(INDEX_DIR_NAME).join("index.db"),
            busy_timeout_ms: 5_000,
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Files processed concurrently within one ingestion run
    pub max_workers: usize,
    /// Files larger than this are not indexed
    pub max_file_bytes: u64,
    /// Walk dot-files and dot-directories
    pub include_hidden: bool,
    /// Honour .gitignore and friends
    pub respect_gitignore: bool,
    /// Remove File records whose paths disappeared from disk
    pub prune_missing: bool,
    /// Directory names that are never descended into
    pub excluded_dirs: Vec<String>,
    /// Bound on embedding one file's chunks
    pub embed_timeout_ms: u64,
    /// Bound on each store operation of one file
    pub store_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_file_bytes: 1 << 20,
            include_hidden: false,
            respect_gitignore: true,
            prune_missing: true,
            excluded_dirs: vec![".git".to_string(), INDEX_DIR_NAME.to_string()],
            embed_timeout_ms: 120_000,
            store_timeout_ms: 30_000,
        }
    }
}

impl IngestConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_include_hidden(mut self, include_hidden: bool) -> Self {
        self.include_hidden = include_hidden;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Number of results when the caller does not specify a limit
    pub default_limit: usize,
    /// Bound on embedding the query plus scoring
    pub timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            timeout_ms: 30_000,
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RetrieverConfig {
    /// Load configuration from a TOML file. `None` or a missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                Self::from_toml_str(&text)?
            }
            Some(path) => {
                tracing::debug!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RetrieverError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(RetrieverError::Config(message.to_string()));

        if self.ingest.max_workers == 0 {
            return fail("ingest.max_workers must be positive");
        }
        if self.ingest.embed_timeout_ms == 0 || self.ingest.store_timeout_ms == 0 {
            return fail("ingest timeouts must be positive");
        }
        if self.query.default_limit == 0 {
            return fail("query.default_limit must be positive");
        }
        if self.query.timeout_ms == 0 {
            return fail("query.timeout_ms must be positive");
        }
        if self.chunking.max_chunk_size == 0 {
            return fail("chunking.max_chunk_size must be positive");
        }
        if self.chunking.unit == ChunkUnit::Lines
            && self.chunking.overlap >= self.chunking.max_chunk_size
        {
            return fail("chunking.overlap must be smaller than chunking.max_chunk_size");
        }
        self.embedding
            .validate()
            .map_err(|e| RetrieverError::Config(e.to_string()))
    }
}
