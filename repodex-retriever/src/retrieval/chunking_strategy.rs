//! Line-based chunking of file content.
//!
//! Content is split on line boundaries. Lines accumulate into the current chunk until the
//! next line would push it past the size limit; then the chunk is closed and a new one
//! starts, optionally re-including the last `overlap` lines of the previous chunk.
//!
//! Chunking is pure and deterministic: the same content and configuration always produce
//! the same chunks, which is what makes re-ingestion idempotent.
//!
//! Line terminators are kept in the chunk text, so with no overlap the chunks concatenate
//! back to the original content exactly.

use serde::{Deserialize, Serialize};

/// How chunk size is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    /// Every line counts as 1
    #[default]
    Lines,
    /// Every line counts as its length in bytes, terminator included
    Bytes,
}

/// Configuration for chunking files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub unit: ChunkUnit,
    /// Maximum size of each chunk, in `unit`s
    pub max_chunk_size: usize,
    /// Lines of the previous chunk repeated at the start of the next
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            unit: ChunkUnit::Lines,
            max_chunk_size: 100,
            overlap: 0,
        }
    }
}

impl ChunkingConfig {
    pub fn lines(max_lines: usize) -> Self {
        Self {
            unit: ChunkUnit::Lines,
            max_chunk_size: max_lines,
            overlap: 0,
        }
    }

    pub fn bytes(max_bytes: usize) -> Self {
        Self {
            unit: ChunkUnit::Bytes,
            max_chunk_size: max_bytes,
            overlap: 0,
        }
    }

    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }
}

/// One chunk of a file. Spans are zero-based and half-open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Position of this chunk within its file (0..n-1)
    pub index: usize,
    pub content: String,
    pub line_start: usize,
    pub line_end: usize,
    pub byte_start: usize,
    pub byte_end: usize,
}

/// Split `content` into ordered chunks.
///
/// Empty content yields no chunks; content within the limit yields exactly one chunk equal
/// to the whole content. A single line larger than a byte limit becomes a chunk on its own.
pub fn chunk_text(content: &str, config: &ChunkingConfig) -> Vec<TextChunk> {
    if content.is_empty() {
        return Vec::new();
    }

    let max = config.max_chunk_size.max(1);
    let weight = |line: &str| match config.unit {
        ChunkUnit::Lines => 1,
        ChunkUnit::Bytes => line.len(),
    };

    let mut lines: Vec<(usize, &str)> = Vec::new();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut size = 0;

    for i in 0..lines.len() {
        let w = weight(lines[i].1);
        if i > start && size + w > max {
            chunks.push(build_chunk(content, &lines, chunks.len(), start, i));

            // Re-include trailing lines for context, but always make progress and never
            // let the overlap alone overflow the next chunk.
            let mut keep = config.overlap.min(i - start - 1);
            let overlap_weight =
                |k: usize| lines[i - k..i].iter().map(|(_, l)| weight(l)).sum::<usize>();
            while keep > 0 && overlap_weight(keep) + w > max {
                keep -= 1;
            }
            start = i - keep;
            size = overlap_weight(keep);
        }
        size += w;
    }
    chunks.push(build_chunk(content, &lines, chunks.len(), start, lines.len()));

    chunks
}

fn build_chunk(
    content: &str,
    lines: &[(usize, &str)],
    index: usize,
    start: usize,
    end: usize,
) -> TextChunk {
    let byte_start = lines[start].0;
    let (last_offset, last_line) = lines[end - 1];
    let byte_end = last_offset + last_line.len();
    TextChunk {
        index,
        content: content[byte_start..byte_end].to_string(),
        line_start: start,
        line_end: end,
        byte_start,
        byte_end,
    }
}

/// Strategy for chunking files
#[derive(Debug, Clone, Default)]
pub struct ChunkingStrategy {
    config: ChunkingConfig,
}

impl ChunkingStrategy {
    /// Create a new chunking strategy with the given configuration
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn chunk_content(&self, content: &str) -> Vec<TextChunk> {
        chunk_text(content, &self.config)
    }
}
