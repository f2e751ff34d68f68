//! Configuration for embedding models

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for embedding models.
///
/// Every field has a default, so the struct can be deserialized from a partial
/// `[embedding]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Name of the embedding model (e.g. "all-MiniLM-L6-v2")
    pub model_name: String,
    /// Directory where model weights are cached. FastEmbed's default when `None`.
    pub cache_dir: Option<PathBuf>,
    /// Dimension D of every produced vector
    pub dimension: usize,
    /// Maximum number of texts per model invocation
    pub batch_size: usize,
    /// Inputs longer than this many characters are truncated
    pub max_input_chars: usize,
    /// Additional load attempts after a failed model load
    pub load_retries: u32,
    /// Base delay between load attempts, multiplied by the attempt number
    pub retry_backoff_ms: u64,
    /// Show the download progress bar when fetching weights
    pub show_download_progress: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model_name: "all-MiniLM-L6-v2".to_string(),
            cache_dir: None,
            dimension: 384,
            batch_size: 16,
            max_input_chars: 8192,
            load_retries: 2,
            retry_backoff_ms: 500,
            show_download_progress: false,
        }
    }
}

impl EmbedConfig {
    /// Create a configuration for the named model with default settings.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    pub fn with_cache_dir<P: AsRef<Path>>(mut self, cache_dir: P) -> Self {
        self.cache_dir = Some(cache_dir.as_ref().to_path_buf());
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars;
        self
    }

    pub fn with_load_retries(mut self, load_retries: u32) -> Self {
        self.load_retries = load_retries;
        self
    }

    /// Get the model name
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Delay before load attempt number `attempt` (1-based) is retried.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Identifier stored next to every embedding so vectors from different models are
    /// never compared with each other.
    pub fn model_version(&self, provider: &str) -> String {
        format!("{provider}:{}:{}", self.model_name, self.dimension)
    }

    /// Reject values that can never produce a working provider.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(EmbedError::invalid_config("model_name must not be empty"));
        }
        if self.dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be positive"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be positive"));
        }
        if self.max_input_chars == 0 {
            return Err(EmbedError::invalid_config(
                "max_input_chars must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EmbedConfig::default();
        assert_eq!(config.model_name(), "all-MiniLM-L6-v2");
        assert_eq!(config.dimension, 384);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EmbedConfig = toml::from_str(
            r#"
            model_name = "bge-base-en-v1.5"
            dimension = 768
            "#,
        )
        .unwrap();

        assert_eq!(config.model_name, "bge-base-en-v1.5");
        assert_eq!(config.dimension, 768);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.load_retries, 2);
    }

    #[test]
    fn test_validation_rejects_zero_dimension() {
        let config = EmbedConfig::default().with_dimension(0);
        assert!(config.validate().is_err());

        let config = EmbedConfig::new("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_version_includes_dimension() {
        let config = EmbedConfig::new("bge-small-en-v1.5");
        assert_eq!(
            config.model_version("fastembed"),
            "fastembed:bge-small-en-v1.5:384"
        );
    }

    #[test]
    fn test_retry_delay_grows_linearly() {
        let config = EmbedConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(500));
        assert_eq!(config.retry_delay(3), Duration::from_millis(1500));
    }
}
