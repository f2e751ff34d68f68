//! # repodex-embed
//!
//! Text embedding providers for repodex. A provider turns text into a fixed-dimension
//! vector; the same provider is used for indexing chunks and for embedding queries so
//! that similarity is always computed in one vector space.
//!
//! ## Providers
//!
//! - [`FastEmbedProvider`]: local ONNX models through FastEmbed. The model is loaded
//!   lazily on the first embedding call and reused for every call after that. Concurrent
//!   first callers wait on the same in-flight load.
//! - [`HashEmbeddingProvider`]: deterministic feature hashing. Needs no model weights,
//!   which makes it suitable for offline use and tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use repodex_embed::{EmbedConfig, EmbeddingProvider, FastEmbedProvider};
//!
//! # async fn example() -> repodex_embed::Result<()> {
//! let provider = FastEmbedProvider::new(EmbedConfig::default());
//!
//! // First call loads the model
//! let vector = provider.embed_text("fn parse_header(buf: &[u8])").await?;
//! assert_eq!(vector.len(), provider.embedding_dimension());
//! # Ok(())
//! # }
//! ```
//!
//! ## Input Limits
//!
//! Inputs longer than [`EmbedConfig::max_input_chars`] are truncated on a character
//! boundary, and empty inputs are padded to a single space before embedding. See
//! [`prepare_input`].
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] using the crate's [`EmbedError`] type.
//! [`EmbedError::is_load_failure`] tells model-load failures apart from per-call failures.

pub mod config;
pub mod error;
pub mod hashing;
mod lazy;
pub mod provider;

pub use config::EmbedConfig;
pub use error::{EmbedError, Result};
pub use hashing::HashEmbeddingProvider;
pub use provider::{
    EmbeddingProvider, EmbeddingResult, FastEmbedProvider, normalize_to_f16, prepare_input,
};
