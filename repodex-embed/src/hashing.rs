//! Deterministic embeddings from hashed tokens.
//!
//! Each identifier-like token of the input is hashed with FNV-1a into one of D buckets,
//! with a sign taken from a second hash bit, and the resulting vector is normalized to unit
//! length. Texts sharing many tokens point in similar directions; identical texts produce
//! identical vectors. No model weights are involved, so the provider never fails to load.

use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult, normalize_to_f16, prepare_input};
use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;

#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimension: usize,
    max_input_chars: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be positive"));
        }
        Ok(Self {
            dimension,
            max_input_chars: 8192,
        })
    }

    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars.max(1);
        self
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let text = prepare_input(text, self.max_input_chars);
        let mut vector = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
        {
            let mut hasher = FnvHasher::default();
            hasher.write(token.to_lowercase().as_bytes());
            let hash = hasher.finish();

            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings = texts
            .iter()
            .map(|text| normalize_to_f16(&self.embed_one(text)))
            .collect();
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "hash"
    }

    fn model_version(&self) -> String {
        format!("hash:fnv1a:{}", self.dimension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn dot(a: &[f16], b: &[f16]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x.to_f32() * y.to_f32()).sum()
    }

    #[tokio::test]
    async fn test_identical_text_identical_vector() -> Result<()> {
        let provider = HashEmbeddingProvider::new(64)?;
        let a = provider.embed_text("fn parse_header(buf: &[u8])").await?;
        let b = provider.embed_text("fn parse_header(buf: &[u8])").await?;

        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((dot(&a, &b) - 1.0).abs() < 0.01);
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_tokens_are_closer() -> Result<()> {
        let provider = HashEmbeddingProvider::new(256)?;
        let query = provider.embed_text("database connection pool").await?;
        let related = provider
            .embed_text("open a database connection from the pool")
            .await?;
        let unrelated = provider.embed_text("render triangle shader").await?;

        assert!(dot(&query, &related) > dot(&query, &unrelated));
        Ok(())
    }

    #[tokio::test]
    async fn test_pathological_inputs() -> Result<()> {
        let provider = HashEmbeddingProvider::new(32)?.with_max_input_chars(16);
        let empty = provider.embed_text("").await?;
        assert_eq!(empty.len(), 32);
        assert!(empty.iter().all(|v| v.to_f32() == 0.0));

        let long = "token ".repeat(100_000);
        let vector = provider.embed_text(&long).await?;
        assert_eq!(vector.len(), 32);
        Ok(())
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(HashEmbeddingProvider::new(0).is_err());
    }

    #[test]
    fn test_model_version() -> Result<()> {
        let provider = HashEmbeddingProvider::new(128)?;
        assert_eq!(provider.model_version(), "hash:fnv1a:128");
        assert_eq!(provider.provider_name(), "hash");
        Ok(())
    }
}
