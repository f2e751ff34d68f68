//! SQLite storage for the index.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE repositories (
//!     id TEXT PRIMARY KEY,               -- uuid v4, immutable
//!     name TEXT UNIQUE NOT NULL,
//!     path TEXT UNIQUE NOT NULL,         -- canonical filesystem path
//!     metadata_json TEXT NOT NULL,       -- JSON object
//!     created_at TEXT NOT NULL,
//!     last_ingested_at TEXT
//! );
//!
//! CREATE TABLE files (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     repository_id TEXT REFERENCES repositories(id) ON DELETE CASCADE,
//!     file_path TEXT NOT NULL,           -- absolute path
//!     file_type TEXT CHECK (file_type IN ('code', 'text', 'binary')),
//!     language TEXT,
//!     size_bytes INTEGER, modified_at INTEGER, content_hash TEXT, indexed_at TEXT,
//!     UNIQUE(repository_id, file_path)
//! );
//!
//! CREATE TABLE chunks (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     file_id INTEGER REFERENCES files(id) ON DELETE CASCADE,
//!     chunk_index INTEGER NOT NULL,      -- dense 0..n-1 per file
//!     content TEXT NOT NULL,
//!     line_start, line_end, byte_start, byte_end INTEGER,
//!     UNIQUE(file_id, chunk_index)
//! );
//!
//! CREATE TABLE embeddings (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     chunk_id INTEGER REFERENCES chunks(id) ON DELETE CASCADE,
//!     vector BLOB NOT NULL,              -- f16 little-endian
//!     dimension INTEGER NOT NULL,
//!     model_version TEXT NOT NULL,
//!     UNIQUE(chunk_id, model_version)
//! );
//! ```
//!
//! ## SQLite settings
//!
//! - **WAL mode** so queries can read while ingestion writes
//! - **Foreign keys** on, with cascading deletes
//! - **Busy timeout** so concurrent writers wait instead of failing
//!
//! The in-memory variant uses a single pooled connection, since every SQLite in-memory
//! connection would otherwise be its own database.

use super::{ChunkRecord, FileId, FileRecord, FileType, IndexStats, vector_to_blob};
use crate::config::StorageConfig;
use crate::error::{Result, RetrieverError};
use crate::retrieval::chunking_strategy::TextChunk;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Everything that gets written for one file in a single transaction.
#[derive(Debug, Clone)]
pub struct FileWrite {
    pub file_path: String,
    pub file_type: FileType,
    pub language: Option<String>,
    pub size_bytes: u64,
    pub modified_at: i64,
    pub content_hash: String,
    pub chunks: Vec<TextChunk>,
    /// One vector per chunk, in chunk order
    pub embeddings: Vec<Vec<half::f16>>,
    pub model_version: String,
}

#[derive(Clone, Debug)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path, config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        tracing::debug!("Opened index database at {}", path.display());
        Self::new_with_pool(pool).await
    }

    /// Open a private in-memory database, for tests and throwaway runs.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                path TEXT UNIQUE NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                last_ingested_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repository_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_type TEXT NOT NULL CHECK (file_type IN ('code', 'text', 'binary')),
                language TEXT,
                size_bytes INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                indexed_at TEXT NOT NULL,
                CONSTRAINT unique_file UNIQUE(repository_id, file_path),
                FOREIGN KEY (repository_id) REFERENCES repositories(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL,
                byte_start INTEGER NOT NULL,
                byte_end INTEGER NOT NULL,
                CONSTRAINT unique_chunk UNIQUE(file_id, chunk_index),
                FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chunk_id INTEGER NOT NULL,
                vector BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                model_version TEXT NOT NULL,
                CONSTRAINT unique_embedding UNIQUE(chunk_id, model_version),
                FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_repository ON files(repository_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_chunk ON embeddings(chunk_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Get the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write a file with its chunks and embeddings, replacing whatever was stored for the same
    /// path. Either everything is written or nothing is.
    pub async fn replace_file(&self, repository_id: &str, write: &FileWrite) -> Result<FileId> {
        if write.chunks.len() != write.embeddings.len() {
            return Err(RetrieverError::invalid_params(
                "embeddings",
                format!(
                    "{} chunks but {} embeddings",
                    write.chunks.len(),
                    write.embeddings.len()
                ),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let file_id: FileId = sqlx::query_scalar(
            r#"
            INSERT INTO files (repository_id, file_path, file_type, language, size_bytes,
                               modified_at, content_hash, indexed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(repository_id, file_path) DO UPDATE SET
                file_type = excluded.file_type,
                language = excluded.language,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at
            RETURNING id
            "#,
        )
        .bind(repository_id)
        .bind(&write.file_path)
        .bind(write.file_type.as_str())
        .bind(&write.language)
        .bind(write.size_bytes as i64)
        .bind(write.modified_at)
        .bind(&write.content_hash)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE file_id = ?1)",
        )
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        for (chunk, vector) in write.chunks.iter().zip(&write.embeddings) {
            let chunk_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO chunks (file_id, chunk_index, content, line_start, line_end,
                                    byte_start, byte_end)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                RETURNING id
                "#,
            )
            .bind(file_id)
            .bind(chunk.index as i64)
            .bind(&chunk.content)
            .bind(chunk.line_start as i64)
            .bind(chunk.line_end as i64)
            .bind(chunk.byte_start as i64)
            .bind(chunk.byte_end as i64)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO embeddings (chunk_id, vector, dimension, model_version) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(chunk_id)
            .bind(vector_to_blob(vector))
            .bind(vector.len() as i64)
            .bind(&write.model_version)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(file_id)
    }

    /// Refresh the modification marker of a file whose content did not change.
    pub async fn touch_file(&self, file_id: FileId, modified_at: i64) -> Result<()> {
        sqlx::query("UPDATE files SET modified_at = ?1, indexed_at = ?2 WHERE id = ?3")
            .bind(modified_at)
            .bind(Utc::now())
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_file(&self, repository_id: &str, file_path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT * FROM files WHERE repository_id = ?1 AND file_path = ?2",
        )
        .bind(repository_id)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    /// All files of a repository, ordered by path
    pub async fn list_files(&self, repository_id: &str) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query("SELECT * FROM files WHERE repository_id = ?1 ORDER BY file_path")
            .bind(repository_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Chunks of a file in chunk order
    pub async fn file_chunks(&self, file_id: FileId) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE file_id = ?1 ORDER BY chunk_index")
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    /// Number of chunks of a file lacking an embedding for `model_version`.
    pub async fn unembedded_chunks(&self, file_id: FileId, model_version: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks c
            WHERE c.file_id = ?1
              AND NOT EXISTS (
                  SELECT 1 FROM embeddings e WHERE e.chunk_id = c.id AND e.model_version = ?2
              )
            "#,
        )
        .bind(file_id)
        .bind(model_version)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Remove files (and their chunks and embeddings) by path. Returns the number of files
    /// removed.
    pub async fn remove_files(&self, repository_id: &str, file_paths: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for file_path in file_paths {
            sqlx::query(
                r#"
                DELETE FROM embeddings WHERE chunk_id IN (
                    SELECT c.id FROM chunks c JOIN files f ON f.id = c.file_id
                    WHERE f.repository_id = ?1 AND f.file_path = ?2
                )
                "#,
            )
            .bind(repository_id)
            .bind(file_path)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"
                DELETE FROM chunks WHERE file_id IN (
                    SELECT id FROM files WHERE repository_id = ?1 AND file_path = ?2
                )
                "#,
            )
            .bind(repository_id)
            .bind(file_path)
            .execute(&mut *tx)
            .await?;
            removed += sqlx::query("DELETE FROM files WHERE repository_id = ?1 AND file_path = ?2")
                .bind(repository_id)
                .bind(file_path)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Row counts over the whole index
    pub async fn index_stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM repositories) AS repositories,
                (SELECT COUNT(*) FROM files) AS files,
                (SELECT COUNT(*) FROM chunks) AS chunks,
                (SELECT COUNT(*) FROM embeddings) AS embeddings
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        stats_from_row(&row)
    }

    /// Row counts reachable from one repository
    pub async fn repository_stats(&self, repository_id: &str) -> Result<IndexStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM repositories WHERE id = ?1) AS repositories,
                (SELECT COUNT(*) FROM files WHERE repository_id = ?1) AS files,
                (SELECT COUNT(*) FROM chunks c JOIN files f ON f.id = c.file_id
                 WHERE f.repository_id = ?1) AS chunks,
                (SELECT COUNT(*) FROM embeddings e
                 JOIN chunks c ON c.id = e.chunk_id
                 JOIN files f ON f.id = c.file_id
                 WHERE f.repository_id = ?1) AS embeddings
            "#,
        )
        .bind(repository_id)
        .fetch_one(&self.pool)
        .await?;
        stats_from_row(&row)
    }
}

fn stats_from_row(row: &SqliteRow) -> Result<IndexStats> {
    Ok(IndexStats {
        repositories: row.try_get::<i64, _>("repositories")? as u64,
        files: row.try_get::<i64, _>("files")? as u64,
        chunks: row.try_get::<i64, _>("chunks")? as u64,
        embeddings: row.try_get::<i64, _>("embeddings")? as u64,
    })
}

pub(crate) fn file_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let file_type: String = row.try_get("file_type")?;
    let file_type = file_type
        .parse::<FileType>()
        .map_err(RetrieverError::IntegrityViolation)?;

    Ok(FileRecord {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        file_path: row.try_get("file_path")?,
        file_type,
        language: row.try_get("language")?,
        size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
        modified_at: row.try_get("modified_at")?,
        content_hash: row.try_get("content_hash")?,
        indexed_at: row.try_get("indexed_at")?,
    })
}

pub(crate) fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        chunk_index: row.try_get::<i64, _>("chunk_index")? as usize,
        content: row.try_get("content")?,
        line_start: row.try_get::<i64, _>("line_start")? as usize,
        line_end: row.try_get::<i64, _>("line_end")? as usize,
        byte_start: row.try_get::<i64, _>("byte_start")? as usize,
        byte_end: row.try_get::<i64, _>("byte_end")? as usize,
    })
}
