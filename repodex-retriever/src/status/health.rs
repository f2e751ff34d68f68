//! Integrity checks and repair for the index.
//!
//! A record is *orphaned* when its parent reference does not resolve. Foreign keys with
//! cascading deletes keep the index clean as long as every writer has them enabled, so
//! orphans only appear after writes made without them (or after external tampering).
//! [`HealthChecker::check`] counts them, [`HealthChecker::repair`] removes everything no
//! longer reachable from a repository, and [`HealthChecker::validate_repository`] looks
//! for semantic problems inside one repository.

use super::types::{HealthReport, RepairReport};
use crate::error::{Result, with_timeout};
use crate::storage::registry::RepositoryRegistry;
use crate::storage::sqlite_store::IndexStore;
use crate::storage::{FileType, IndexStats};
use chrono::Utc;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const ORPHAN_FILES: &str =
    "NOT EXISTS (SELECT 1 FROM repositories r WHERE r.id = files.repository_id)";
const ORPHAN_CHUNKS: &str = "NOT EXISTS (SELECT 1 FROM files f WHERE f.id = chunks.file_id)";
const ORPHAN_EMBEDDINGS: &str =
    "NOT EXISTS (SELECT 1 FROM chunks c WHERE c.id = embeddings.chunk_id)";

#[derive(Clone, Debug)]
pub struct HealthChecker {
    store: IndexStore,
    registry: RepositoryRegistry,
    expected_dimension: Option<usize>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(store: IndexStore) -> Self {
        Self {
            registry: RepositoryRegistry::new(store.clone()),
            store,
            expected_dimension: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Also flag embeddings whose dimension differs from `dimension`.
    pub fn with_expected_dimension(mut self, dimension: usize) -> Self {
        self.expected_dimension = Some(dimension);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Count rows and orphans. Never modifies the index.
    pub async fn check(&self) -> Result<HealthReport> {
        with_timeout("health check", self.timeout, async {
            let stats = self.store.index_stats().await?;
            let row = sqlx::query(&format!(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM files WHERE {ORPHAN_FILES}) AS orphan_files,
                    (SELECT COUNT(*) FROM chunks WHERE {ORPHAN_CHUNKS}) AS orphan_chunks,
                    (SELECT COUNT(*) FROM embeddings WHERE {ORPHAN_EMBEDDINGS}) AS orphan_embeddings
                "#
            ))
            .fetch_one(self.store.pool())
            .await?;

            let orphan_files = row.try_get::<i64, _>("orphan_files")? as u64;
            let orphan_chunks = row.try_get::<i64, _>("orphan_chunks")? as u64;
            let orphan_embeddings = row.try_get::<i64, _>("orphan_embeddings")? as u64;
            let probe_error = self.probe().await;

            let report = HealthReport {
                stats,
                orphan_files,
                orphan_chunks,
                orphan_embeddings,
                probe_ok: probe_error.is_none(),
                healthy: probe_error.is_none()
                    && orphan_files + orphan_chunks + orphan_embeddings == 0,
                probe_error,
                checked_at: Utc::now(),
            };
            if report.healthy {
                debug!("Index healthy: {:?}", report.stats);
            } else {
                warn!(
                    "Index unhealthy: {} orphaned files, {} orphaned chunks, {} orphaned embeddings",
                    orphan_files, orphan_chunks, orphan_embeddings
                );
            }
            Ok(report)
        })
        .await
    }

    /// `None` when the database passes `PRAGMA quick_check`, otherwise what went wrong.
    async fn probe(&self) -> Option<String> {
        match sqlx::query("PRAGMA quick_check")
            .fetch_all(self.store.pool())
            .await
        {
            Ok(rows) => {
                let messages: Vec<String> = rows
                    .iter()
                    .filter_map(|row| row.try_get::<String, _>(0).ok())
                    .collect();
                if messages.len() == 1 && messages[0] == "ok" {
                    None
                } else {
                    Some(messages.join("; "))
                }
            }
            Err(e) => Some(e.to_string()),
        }
    }

    /// Delete everything no longer reachable from a repository, children first.
    ///
    /// Runs in one transaction. Running it again right away removes nothing.
    pub async fn repair(&self) -> Result<RepairReport> {
        with_timeout("repair", self.timeout, async {
            let mut tx = self.store.pool().begin().await?;

            let embeddings_removed = sqlx::query(
                r#"
                DELETE FROM embeddings WHERE NOT EXISTS (
                    SELECT 1 FROM chunks c
                    JOIN files f ON f.id = c.file_id
                    JOIN repositories r ON r.id = f.repository_id
                    WHERE c.id = embeddings.chunk_id
                )
                "#,
            )
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let chunks_removed = sqlx::query(
                r#"
                DELETE FROM chunks WHERE NOT EXISTS (
                    SELECT 1 FROM files f
                    JOIN repositories r ON r.id = f.repository_id
                    WHERE f.id = chunks.file_id
                )
                "#,
            )
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let files_removed = sqlx::query(&format!("DELETE FROM files WHERE {ORPHAN_FILES}"))
                .execute(&mut *tx)
                .await?
                .rows_affected();

            tx.commit().await?;

            let report = RepairReport {
                embeddings_removed,
                chunks_removed,
                files_removed,
            };
            if report.rows_removed() > 0 {
                info!(
                    "Repair removed {} embeddings, {} chunks, {} files",
                    embeddings_removed, chunks_removed, files_removed
                );
            } else {
                debug!("Repair found nothing to remove");
            }
            Ok(report)
        })
        .await
    }

    /// Human-readable problems found in one repository's files, chunks and embeddings.
    ///
    /// `repository` is resolved like any other repository key. An empty list means no
    /// problems were found. Nothing is modified.
    pub async fn validate_repository(&self, repository: &str) -> Result<Vec<String>> {
        with_timeout(
            "validate repository",
            self.timeout,
            self.collect_issues(repository),
        )
        .await
    }

    async fn collect_issues(&self, repository: &str) -> Result<Vec<String>> {
        let repository = self.registry.require(repository).await?;
        let mut issues = Vec::new();

        let files = sqlx::query(
            r#"
            SELECT f.id, f.file_path, f.file_type, f.size_bytes,
                   COUNT(c.id) AS chunk_count,
                   MIN(c.chunk_index) AS min_index,
                   MAX(c.chunk_index) AS max_index,
                   SUM(CASE WHEN c.id IS NOT NULL AND NOT EXISTS (
                       SELECT 1 FROM embeddings e WHERE e.chunk_id = c.id
                   ) THEN 1 ELSE 0 END) AS unembedded
            FROM files f
            LEFT JOIN chunks c ON c.file_id = f.id
            WHERE f.repository_id = ?1
            GROUP BY f.id
            ORDER BY f.file_path
            "#,
        )
        .bind(&repository.id)
        .fetch_all(self.store.pool())
        .await?;

        for row in &files {
            let file_id: i64 = row.try_get("id")?;
            let path: String = row.try_get("file_path")?;
            let file_type: String = row.try_get("file_type")?;
            let size_bytes: i64 = row.try_get("size_bytes")?;
            let chunk_count: i64 = row.try_get("chunk_count")?;
            let unembedded: i64 = row.try_get("unembedded")?;

            match file_type.parse::<FileType>() {
                Ok(FileType::Binary) if chunk_count > 0 => issues.push(format!(
                    "file {path} is classified as binary but has {chunk_count} chunks"
                )),
                Ok(FileType::Binary) => {}
                Ok(kind) if chunk_count == 0 && size_bytes > 0 => issues.push(format!(
                    "file {path} has 0 chunks but is classified as {kind}"
                )),
                Ok(_) => {}
                Err(e) => issues.push(format!("file {path}: {e}")),
            }

            if chunk_count > 0 {
                let min_index: i64 = row.try_get("min_index")?;
                let max_index: i64 = row.try_get("max_index")?;
                if min_index != 0 || max_index != chunk_count - 1 {
                    let indexes = self
                        .store
                        .file_chunks(file_id)
                        .await?
                        .iter()
                        .map(|c| c.chunk_index.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    issues.push(format!(
                        "file {path} has non-contiguous chunk indexes [{indexes}]"
                    ));
                }
            }

            if unembedded > 0 {
                issues.push(format!(
                    "file {path} has {unembedded} chunks without an embedding"
                ));
            }

            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                issues.push(format!("file {path} is missing on disk"));
            }
        }

        let embeddings = sqlx::query(
            r#"
            SELECT e.id, e.dimension, length(e.vector) AS vector_bytes, c.chunk_index, f.file_path
            FROM embeddings e
            JOIN chunks c ON c.id = e.chunk_id
            JOIN files f ON f.id = c.file_id
            WHERE f.repository_id = ?1
            ORDER BY f.file_path, c.chunk_index, e.id
            "#,
        )
        .bind(&repository.id)
        .fetch_all(self.store.pool())
        .await?;

        for row in &embeddings {
            let dimension = row.try_get::<i64, _>("dimension")? as usize;
            let values = row.try_get::<i64, _>("vector_bytes")? as usize / 2;
            let chunk_index: i64 = row.try_get("chunk_index")?;
            let path: String = row.try_get("file_path")?;

            if dimension != values {
                issues.push(format!(
                    "embedding of chunk {chunk_index} in {path} records dimension {dimension} but holds {values} values"
                ));
            } else if let Some(expected) = self.expected_dimension.filter(|&d| d != dimension) {
                issues.push(format!(
                    "embedding of chunk {chunk_index} in {path} has dimension {dimension}, expected {expected}"
                ));
            }
        }

        debug!(
            "Validated repository {}: {} files, {} issues",
            repository.name,
            files.len(),
            issues.len()
        );
        Ok(issues)
    }

    /// Row counts for one repository
    pub async fn repository_stats(&self, repository: &str) -> Result<IndexStats> {
        let repository = self.registry.require(repository).await?;
        self.store.repository_stats(&repository.id).await
    }
}
