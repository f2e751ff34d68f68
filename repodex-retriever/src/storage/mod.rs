//! Persistent index storage.
//!
//! The index is four relations forming a strict ownership chain:
//!
//! ```text
//! Repository ─< File ─< Chunk ─< Embedding
//! ```
//!
//! - [`sqlite_store::IndexStore`] owns the SQLite schema and the per-file atomic write path
//! - [`registry::RepositoryRegistry`] is CRUD and lookup over repository records
//!
//! The record types below are what readers of the index get back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub mod registry;
pub mod sqlite_store;

/// Opaque repository identifier (a UUID string).
pub type RepositoryId = String;

/// Database ID of a file row.
pub type FileId = i64;

/// Database ID of a chunk row.
pub type ChunkId = i64;

/// Classification of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Code,
    Text,
    Binary,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Code => "code",
            FileType::Text => "text",
            FileType::Binary => "binary",
        }
    }

    /// Whether files of this type are chunked and embedded
    pub fn is_indexable(&self) -> bool {
        !matches!(self, FileType::Binary)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(FileType::Code),
            "text" => Ok(FileType::Text),
            "binary" => Ok(FileType::Binary),
            other => Err(format!("unknown file type: {other}")),
        }
    }
}

/// A registered repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub path: PathBuf,
    /// Arbitrary caller metadata, always a JSON object
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_ingested_at: Option<DateTime<Utc>>,
}

/// A file row of the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: FileId,
    pub repository_id: RepositoryId,
    /// Absolute path of the file
    pub file_path: String,
    pub file_type: FileType,
    pub language: Option<String>,
    pub size_bytes: u64,
    /// Modification time in milliseconds since the Unix epoch
    pub modified_at: i64,
    /// Hex-encoded blake3 hash of the file content
    pub content_hash: String,
    pub indexed_at: DateTime<Utc>,
}

/// A chunk row of the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub file_id: FileId,
    pub chunk_index: usize,
    pub content: String,
    pub line_start: usize,
    pub line_end: usize,
    pub byte_start: usize,
    pub byte_end: usize,
}

/// Counts of rows in the index, either overall or for one repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub repositories: u64,
    pub files: u64,
    pub chunks: u64,
    pub embeddings: u64,
}

/// Encode an f16 vector as a little-endian blob.
pub fn vector_to_blob(vector: &[half::f16]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

/// Decode a blob written by [`vector_to_blob`]. A trailing odd byte is ignored.
pub fn blob_to_vector(bytes: &[u8]) -> Vec<half::f16> {
    bytes
        .chunks_exact(2)
        .map(|pair| half::f16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
