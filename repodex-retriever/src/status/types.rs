use crate::error::{Result, RetrieverError};
use crate::storage::IndexStats;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of a read-only integrity scan over the whole index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Row counts per relation
    pub stats: IndexStats,
    /// Files whose repository does not exist
    pub orphan_files: u64,
    /// Chunks whose file does not exist
    pub orphan_chunks: u64,
    /// Embeddings whose chunk does not exist
    pub orphan_embeddings: u64,
    /// Whether the database answered `PRAGMA quick_check` with "ok"
    pub probe_ok: bool,
    /// What the probe reported when it did not succeed
    pub probe_error: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// No orphans and a successful probe
    pub healthy: bool,
}

impl HealthReport {
    pub fn orphan_total(&self) -> u64 {
        self.orphan_files + self.orphan_chunks + self.orphan_embeddings
    }

    /// Turn an unhealthy report into an [`RetrieverError::IntegrityViolation`].
    pub fn ensure_healthy(&self) -> Result<()> {
        if self.healthy {
            return Ok(());
        }
        let mut problems = Vec::new();
        if self.orphan_files > 0 {
            problems.push(format!("{} orphaned files", self.orphan_files));
        }
        if self.orphan_chunks > 0 {
            problems.push(format!("{} orphaned chunks", self.orphan_chunks));
        }
        if self.orphan_embeddings > 0 {
            problems.push(format!("{} orphaned embeddings", self.orphan_embeddings));
        }
        if !self.probe_ok {
            problems.push(format!(
                "database probe failed: {}",
                self.probe_error.as_deref().unwrap_or("unknown error")
            ));
        }
        Err(RetrieverError::IntegrityViolation(problems.join(", ")))
    }
}

/// Rows deleted by a repair, per relation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub embeddings_removed: u64,
    pub chunks_removed: u64,
    pub files_removed: u64,
}

impl RepairReport {
    pub fn rows_removed(&self) -> u64 {
        self.embeddings_removed + self.chunks_removed + self.files_removed
    }
}
