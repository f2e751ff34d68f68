//! Error types for repodex-retriever.
//!
//! Every failure carries a human-readable message (its `Display`) and a
//! machine-checkable [`ErrorKind`].

use repodex_embed::EmbedError;
use serde::Serialize;
use std::time::Duration;

/// Machine-checkable category of a [`RetrieverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A lookup missed an identity
    NotFound,
    /// Malformed input, rejected before any I/O
    InvalidParams,
    /// Duplicate identity on create
    Conflict,
    /// The embedding model is unavailable or misbehaved
    DependencyFailure,
    /// Dangling references or inconsistent index contents
    IntegrityViolation,
    /// A bounded operation exceeded its timeout
    Timeout,
    /// The persistent store failed
    Storage,
    /// Filesystem access failed
    Io,
    /// The configuration is unusable
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum RetrieverError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("invalid parameter `{param}`: {message}")]
    InvalidParams {
        param: &'static str,
        message: String,
    },

    #[error("{entity} already exists: {key}")]
    Conflict { entity: &'static str, key: String },

    #[error("embedding dependency failed: {0}")]
    DependencyFailure(#[from] EmbedError),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RetrieverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidParams { .. } => ErrorKind::InvalidParams,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::DependencyFailure(_) => ErrorKind::DependencyFailure,
            Self::IntegrityViolation(_) => ErrorKind::IntegrityViolation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Database(_) => ErrorKind::Storage,
            Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn invalid_params(param: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidParams {
            param,
            message: message.into(),
        }
    }

    pub fn conflict(entity: &'static str, key: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            key: key.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RetrieverError>;

/// Run `future`, failing with [`RetrieverError::Timeout`] if it does not finish in time.
pub async fn with_timeout<T, F>(operation: &'static str, timeout: Duration, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(RetrieverError::Timeout { operation, timeout }),
    }
}
