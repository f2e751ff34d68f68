//! Embedding provider implementations

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::lazy::LazyModel;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use half::f16;
use std::sync::{Arc, Mutex, PoisonError};

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result. The dimension is inferred from the first vector
    /// and defaults to 0 for an empty result.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate the embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::embedding_gen("no embedding generated for text"))
    }

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Dimension D of every vector this provider produces
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;

    /// Version tag stored with each embedding; vectors with different tags live in
    /// different spaces and are never compared.
    fn model_version(&self) -> String;
}

/// Clamp a text to the model's input limit.
///
/// Text longer than `max_chars` characters is truncated on a character boundary. Empty or
/// whitespace-only text is padded to a single space so every input yields a vector.
pub fn prepare_input(text: &str, max_chars: usize) -> String {
    if text.trim().is_empty() {
        return " ".to_string();
    }
    match text.char_indices().nth(max_chars) {
        Some((byte_offset, _)) => text[..byte_offset].to_string(),
        None => text.to_string(),
    }
}

/// Scale a vector to unit length and convert it to f16. Zero vectors stay zero.
pub fn normalize_to_f16(embedding: &[f32]) -> Vec<f16> {
    let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        embedding.iter().map(|x| f16::from_f32(x / norm)).collect()
    } else {
        embedding.iter().map(|x| f16::from_f32(*x)).collect()
    }
}

/// Built-in FastEmbed models this provider knows how to load, with their dimensions.
fn known_model(name: &str) -> Option<(EmbeddingModel, usize)> {
    let model = match name {
        "all-MiniLM-L6-v2" | "AllMiniLML6V2" => (EmbeddingModel::AllMiniLML6V2, 384),
        "all-MiniLM-L12-v2" | "AllMiniLML12V2" => (EmbeddingModel::AllMiniLML12V2, 384),
        "bge-small-en-v1.5" | "BGESmallENV15" => (EmbeddingModel::BGESmallENV15, 384),
        "bge-base-en-v1.5" | "BGEBaseENV15" => (EmbeddingModel::BGEBaseENV15, 768),
        "nomic-embed-text-v1.5" | "NomicEmbedTextV15" => {
            (EmbeddingModel::NomicEmbedTextV15, 768)
        }
        "snowflake-arctic-embed-xs" | "SnowflakeArcticEmbedXS" => {
            (EmbeddingModel::SnowflakeArcticEmbedXS, 384)
        }
        _ => return None,
    };
    Some(model)
}

type SharedModel = Mutex<TextEmbedding>;

/// FastEmbed-based embedding provider using local ONNX models.
///
/// Construction is cheap and never touches the model. The first embedding call loads
/// the weights (downloading them into the cache directory if needed); concurrent first
/// callers wait on that single load. Cloning the provider behind an `Arc` shares the
/// loaded model.
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: LazyModel<SharedModel>,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("loaded", &self.model.is_loaded())
            .finish()
    }
}

impl FastEmbedProvider {
    /// Creates a new provider. The model is not loaded until the first embedding call.
    pub fn new(config: EmbedConfig) -> Self {
        Self {
            config,
            model: LazyModel::new(),
        }
    }

    /// Whether the model weights have been loaded
    pub fn is_loaded(&self) -> bool {
        self.model.is_loaded()
    }

    /// Number of load attempts made so far (successful or not)
    pub fn load_attempts(&self) -> u32 {
        self.model.attempts()
    }

    /// Force the model to load now instead of on the first embedding call.
    pub async fn warm_up(&self) -> Result<()> {
        self.model().await.map(|_| ())
    }

    async fn model(&self) -> Result<Arc<SharedModel>> {
        self.config.validate()?;
        let (model_kind, native_dimension) = known_model(&self.config.model_name)
            .ok_or_else(|| {
                EmbedError::invalid_config(format!(
                    "unknown FastEmbed model: {}",
                    self.config.model_name
                ))
            })?;
        if native_dimension != self.config.dimension {
            return Err(EmbedError::invalid_config(format!(
                "model {} produces {native_dimension}-dimensional vectors, configured dimension is {}",
                self.config.model_name, self.config.dimension
            )));
        }

        self.model
            .get_or_load(
                self.config.load_retries,
                |attempt| self.config.retry_delay(attempt),
                || self.load(model_kind.clone()),
            )
            .await
    }

    async fn load(&self, model_kind: EmbeddingModel) -> Result<SharedModel> {
        tracing::info!(model = %self.config.model_name, "Loading embedding model");

        let mut options = InitOptions::new(model_kind)
            .with_show_download_progress(self.config.show_download_progress);
        if let Some(cache_dir) = &self.config.cache_dir {
            options = options.with_cache_dir(cache_dir.clone());
        }

        let model = tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
            .await?
            .map_err(|e| EmbedError::External { source: e })?;

        tracing::info!(model = %self.config.model_name, "Embedding model loaded");
        Ok(Mutex::new(model))
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        let model = self.model().await?;

        tracing::debug!("Generating embeddings for {} texts", texts.len());

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size) {
            let batch: Vec<String> = batch
                .iter()
                .map(|text| prepare_input(text, self.config.max_input_chars))
                .collect();
            let model = Arc::clone(&model);

            let raw = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut guard = model.lock().unwrap_or_else(PoisonError::into_inner);
                guard
                    .embed(batch, None)
                    .map_err(|e| EmbedError::External { source: e })
            })
            .await??;

            for embedding in raw {
                if embedding.len() != self.config.dimension {
                    return Err(EmbedError::DimensionMismatch {
                        expected: self.config.dimension,
                        actual: embedding.len(),
                    });
                }
                all_embeddings.push(normalize_to_f16(&embedding));
            }
        }

        if all_embeddings.len() != texts.len() {
            return Err(EmbedError::embedding_gen(format!(
                "model returned {} embeddings for {} texts",
                all_embeddings.len(),
                texts.len()
            )));
        }

        Ok(EmbeddingResult::new(all_embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.config.dimension
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }

    fn model_version(&self) -> String {
        self.config.model_version(self.provider_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_result() {
        let embeddings = vec![
            vec![f16::from_f32(0.1), f16::from_f32(0.2), f16::from_f32(0.3)],
            vec![f16::from_f32(0.4), f16::from_f32(0.5), f16::from_f32(0.6)],
        ];
        let result = EmbeddingResult::new(embeddings);

        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 3);
        assert!(!result.is_empty());
        assert_eq!(EmbeddingResult::new(vec![]).dimension, 0);
    }

    #[test]
    fn test_prepare_input_truncates_on_char_boundary() {
        assert_eq!(prepare_input("héllo wörld", 4), "héll");
        assert_eq!(prepare_input("short", 100), "short");
        assert_eq!(prepare_input("", 10), " ");
        assert_eq!(prepare_input("  \n\t", 10), " ");
    }

    #[test]
    fn test_normalize_to_f16() {
        let normalized = normalize_to_f16(&[3.0, 4.0]);
        assert!((normalized[0].to_f32() - 0.6).abs() < 1e-3);
        assert!((normalized[1].to_f32() - 0.8).abs() < 1e-3);

        let zero = normalize_to_f16(&[0.0, 0.0]);
        assert!(zero.iter().all(|v| v.to_f32() == 0.0));
    }

    #[test]
    fn test_provider_creation_does_not_load() {
        let provider = FastEmbedProvider::new(EmbedConfig::default());

        assert_eq!(provider.provider_name(), "fastembed");
        assert_eq!(provider.embedding_dimension(), 384);
        assert_eq!(provider.model_version(), "fastembed:all-MiniLM-L6-v2:384");
        assert!(!provider.is_loaded());
        assert_eq!(provider.load_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unknown_model_is_a_load_failure() {
        let provider = FastEmbedProvider::new(EmbedConfig::new("no-such-model"));

        let err = provider.embed_text("hello").await.unwrap_err();
        assert!(err.is_load_failure());
        assert!(err.to_string().contains("no-such-model"));
        assert!(!provider.is_loaded());
        assert_eq!(provider.load_attempts(), 0);
    }

    #[tokio::test]
    async fn test_dimension_disagreement_is_rejected_before_loading() {
        let provider =
            FastEmbedProvider::new(EmbedConfig::new("bge-base-en-v1.5").with_dimension(384));

        let err = provider.warm_up().await.unwrap_err();
        assert!(matches!(err, EmbedError::InvalidConfig { .. }));
        assert_eq!(provider.load_attempts(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_needs_no_model() {
        let provider = FastEmbedProvider::new(EmbedConfig::new("no-such-model"));
        let result = provider.embed_texts(&[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_known_models() {
        assert_eq!(known_model("all-MiniLM-L6-v2").map(|(_, d)| d), Some(384));
        assert_eq!(known_model("bge-base-en-v1.5").map(|(_, d)| d), Some(768));
        assert!(known_model("gpt-embedding").is_none());
    }

    #[tokio::test]
    #[ignore] // Downloads real model weights - run with: cargo test -- --ignored
    async fn test_fastembed_download_and_embedding() -> Result<()> {
        let provider = FastEmbedProvider::new(EmbedConfig::default());

        let embedding = provider
            .embed_text("Transformer architectures embed source code.")
            .await?;
        assert_eq!(embedding.len(), 384);
        assert!(embedding.iter().all(|x| x.to_f32().is_finite()));
        assert!(provider.is_loaded());

        let batch = provider
            .embed_texts(&["fn main() {}".to_string(), String::new()])
            .await?;
        assert_eq!(batch.len(), 2);
        assert_eq!(provider.load_attempts(), 1);
        Ok(())
    }
}
