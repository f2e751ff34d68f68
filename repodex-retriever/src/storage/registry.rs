//! Repository registry: create, look up, update and delete repository records.
//!
//! A repository can be looked up by name, by filesystem path, or by its opaque id.
//! [`RepositoryRegistry::resolve`] tries them in that fixed order, so when a user-supplied
//! string could mean several repositories the human-friendly name always wins.
//!
//! The `get_by_*` lookups report absence as `Ok(None)`; only [`RepositoryRegistry::require`]
//! turns absence into a `NotFound` error.

use super::sqlite_store::IndexStore;
use super::{IndexStats, Repository, RepositoryId};
use crate::error::{Result, RetrieverError};
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::path::{Path, PathBuf};

/// One way of interpreting a user-supplied repository key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    Name,
    Path,
    Id,
}

/// Order in which [`RepositoryRegistry::resolve`] interprets a key. First match wins.
pub const RESOLUTION_ORDER: [LookupStrategy; 3] =
    [LookupStrategy::Name, LookupStrategy::Path, LookupStrategy::Id];

#[derive(Clone, Debug)]
pub struct RepositoryRegistry {
    store: IndexStore,
}

impl RepositoryRegistry {
    pub fn new(store: IndexStore) -> Self {
        Self { store }
    }

    /// Register a new repository. Fails with `Conflict` if the name or path is taken.
    pub async fn create(
        &self,
        name: &str,
        path: &Path,
        metadata: Map<String, Value>,
    ) -> Result<Repository> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RetrieverError::invalid_params("name", "must not be empty"));
        }
        if path.as_os_str().is_empty() {
            return Err(RetrieverError::invalid_params("path", "must not be empty"));
        }

        let path = normalize_path(path);
        if self.get_by_name(name).await?.is_some() {
            return Err(RetrieverError::conflict("repository", name));
        }
        if self.get_by_path(&path).await?.is_some() {
            return Err(RetrieverError::conflict(
                "repository",
                path.display().to_string(),
            ));
        }

        let repository = Repository {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            path,
            metadata,
            created_at: Utc::now(),
            last_ingested_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO repositories (id, name, path, metadata_json, created_at, last_ingested_at)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL)
            "#,
        )
        .bind(&repository.id)
        .bind(&repository.name)
        .bind(path_key(&repository.path))
        .bind(Value::Object(repository.metadata.clone()).to_string())
        .bind(repository.created_at)
        .execute(self.store.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RetrieverError::conflict("repository", name)
            }
            other => other.into(),
        })?;

        tracing::info!(id = %repository.id, name, "Registered repository");
        Ok(repository)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Repository>> {
        self.fetch_one_where("id", id).await
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Repository>> {
        self.fetch_one_where("name", name).await
    }

    pub async fn get_by_path(&self, path: &Path) -> Result<Option<Repository>> {
        self.fetch_one_where("path", &path_key(&normalize_path(path)))
            .await
    }

    async fn fetch_one_where(&self, column: &'static str, value: &str) -> Result<Option<Repository>> {
        let sql = format!("SELECT * FROM repositories WHERE {column} = ?1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(repository_from_row).transpose()
    }

    /// Look up a repository by a key that may be a name, a path or an id.
    pub async fn resolve(&self, key: &str) -> Result<Option<Repository>> {
        if key.trim().is_empty() {
            return Err(RetrieverError::invalid_params("repository", "must not be empty"));
        }

        for strategy in RESOLUTION_ORDER {
            let found = match strategy {
                LookupStrategy::Name => self.get_by_name(key).await?,
                LookupStrategy::Path => self.get_by_path(Path::new(key)).await?,
                LookupStrategy::Id => self.get_by_id(key).await?,
            };
            if let Some(repository) = found {
                tracing::debug!(key, ?strategy, id = %repository.id, "Resolved repository");
                return Ok(Some(repository));
            }
        }
        Ok(None)
    }

    /// Like [`resolve`](Self::resolve), but absence is a `NotFound` error.
    pub async fn require(&self, key: &str) -> Result<Repository> {
        self.resolve(key)
            .await?
            .ok_or_else(|| RetrieverError::not_found("repository", key))
    }

    /// Merge `partial` into the stored metadata. A `null` value removes its key.
    pub async fn update(&self, id: &str, partial: Map<String, Value>) -> Result<Repository> {
        let mut repository = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| RetrieverError::not_found("repository", id))?;

        for (key, value) in partial {
            if value.is_null() {
                repository.metadata.remove(&key);
            } else {
                repository.metadata.insert(key, value);
            }
        }

        sqlx::query("UPDATE repositories SET metadata_json = ?1 WHERE id = ?2")
            .bind(Value::Object(repository.metadata.clone()).to_string())
            .bind(id)
            .execute(self.store.pool())
            .await?;
        Ok(repository)
    }

    /// Record that an ingestion run just finished.
    pub async fn touch_ingested(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE repositories SET last_ingested_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(RetrieverError::not_found("repository", id));
        }
        Ok(())
    }

    /// All repositories, ordered by name
    pub async fn list(&self) -> Result<Vec<Repository>> {
        let rows = sqlx::query("SELECT * FROM repositories ORDER BY name")
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(repository_from_row).collect()
    }

    /// Delete a repository and everything it owns. Returns the number of rows removed per
    /// relation.
    pub async fn delete(&self, id: &RepositoryId) -> Result<IndexStats> {
        let mut tx = self.store.pool().begin().await?;

        let embeddings = sqlx::query(
            r#"
            DELETE FROM embeddings WHERE chunk_id IN (
                SELECT c.id FROM chunks c JOIN files f ON f.id = c.file_id
                WHERE f.repository_id = ?1
            )
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let chunks = sqlx::query(
            "DELETE FROM chunks WHERE file_id IN (SELECT id FROM files WHERE repository_id = ?1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let files = sqlx::query("DELETE FROM files WHERE repository_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let repositories = sqlx::query("DELETE FROM repositories WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if repositories == 0 {
            tx.rollback().await?;
            return Err(RetrieverError::not_found("repository", id.as_str()));
        }
        tx.commit().await?;

        tracing::info!(id = %id, files, chunks, embeddings, "Deleted repository");
        Ok(IndexStats {
            repositories,
            files,
            chunks,
            embeddings,
        })
    }
}

/// Canonical form of a repository path: resolved symlinks when the path exists, otherwise
/// made absolute against the working directory.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    // A path that no longer exists still resolves through its parent.
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Ok(parent) = std::fs::canonicalize(parent) {
            return parent.join(name);
        }
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn repository_from_row(row: &SqliteRow) -> Result<Repository> {
    let metadata_json: String = row.try_get("metadata_json")?;
    let metadata = match serde_json::from_str::<Value>(&metadata_json) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            return Err(RetrieverError::IntegrityViolation(format!(
                "repository metadata is not a JSON object: {metadata_json}"
            )));
        }
    };

    Ok(Repository {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        path: PathBuf::from(row.try_get::<String, _>("path")?),
        metadata,
        created_at: row.try_get("created_at")?,
        last_ingested_at: row.try_get("last_ingested_at")?,
    })
}
