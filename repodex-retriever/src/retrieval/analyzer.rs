//! Walking a repository and classifying its files.
//!
//! [`RepositoryWalker::walk`] returns a lazy iterator of [`FileDescriptor`]s. Each walk starts
//! from the root; an iterator cannot be restarted. Symlinks, excluded directories (including
//! the index's own `.repodex` directory) and oversized files are never emitted.
//!
//! Classification:
//! - **binary** if the extension is on the deny list, or the first 8 KiB contain a NUL byte or
//!   are not valid UTF-8
//! - **text** for prose extensions and anything without a known language
//! - **code** for extensions with a known programming language

use crate::config::IngestConfig;
use crate::error::{Result, RetrieverError};
use crate::storage::FileType;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// How many leading bytes are inspected for binary detection
const SNIFF_LEN: usize = 8192;

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "mp3", "mp4", "wav", "ogg",
    "webm", "avi", "mov", "zip", "tar", "gz", "tgz", "bz2", "xz", "7z", "rar", "jar", "exe",
    "dll", "so", "dylib", "bin", "o", "obj", "a", "lib", "class", "pyc", "pyo", "wasm", "woff",
    "woff2", "ttf", "otf", "eot", "pdf", "sqlite", "db",
];

const PROSE_EXTENSIONS: &[&str] = &["md", "markdown", "txt", "rst", "adoc", "org"];

/// A file found by the walker.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDescriptor {
    /// Absolute path
    pub path: PathBuf,
    /// Path relative to the repository root
    pub relative_path: PathBuf,
    pub file_type: FileType,
    pub language: Option<String>,
    pub size_bytes: u64,
    /// Milliseconds since the Unix epoch
    pub modified_at: i64,
}

/// Detect language from file extension
pub fn detect_language(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let language = match ext.as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "lua" => "lua",
        "sh" | "bash" | "zsh" => "shell",
        "sql" => "sql",
        "html" | "htm" => "html",
        "css" | "scss" => "css",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "xml" => "xml",
        "md" | "markdown" => "markdown",
        _ => return None,
    };
    Some(language.to_string())
}

fn extension_in(path: &Path, list: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| list.contains(&ext.to_lowercase().as_str()))
}

/// Whether a leading sample of a file looks binary.
///
/// An incomplete multi-byte sequence at the very end of the sample is not counted against it,
/// since the sample may cut a character in half.
pub fn is_binary_content(sample: &[u8]) -> bool {
    let sample = &sample[..sample.len().min(SNIFF_LEN)];
    if sample.contains(&0) {
        return true;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => false,
        Err(e) => e.error_len().is_some(),
    }
}

/// Classify a file by its extension and leading bytes.
pub fn classify_file(path: &Path) -> Result<(FileType, Option<String>)> {
    if extension_in(path, BINARY_EXTENSIONS) {
        return Ok((FileType::Binary, None));
    }

    let mut sample = Vec::with_capacity(SNIFF_LEN);
    std::fs::File::open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut sample)?;
    if is_binary_content(&sample) {
        return Ok((FileType::Binary, None));
    }

    let language = detect_language(path);
    let file_type = if extension_in(path, PROSE_EXTENSIONS) || language.is_none() {
        FileType::Text
    } else {
        FileType::Code
    };
    Ok((file_type, language))
}

/// Modification time of `metadata` in milliseconds since the Unix epoch
pub fn modified_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Build the descriptor of a single file under `root`.
pub fn describe_file(root: &Path, path: &Path) -> Result<FileDescriptor> {
    let metadata = std::fs::metadata(path)?;
    let (file_type, language) = classify_file(path)?;
    Ok(FileDescriptor {
        path: path.to_path_buf(),
        relative_path: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
        file_type,
        language,
        size_bytes: metadata.len(),
        modified_at: modified_millis(&metadata),
    })
}

/// Enumerates the files of one repository.
#[derive(Debug, Clone)]
pub struct RepositoryWalker {
    root: PathBuf,
    max_file_bytes: u64,
    include_hidden: bool,
    respect_gitignore: bool,
    excluded_dirs: Vec<String>,
}

impl RepositoryWalker {
    pub fn new(root: impl Into<PathBuf>, config: &IngestConfig) -> Self {
        Self {
            root: root.into(),
            max_file_bytes: config.max_file_bytes,
            include_hidden: config.include_hidden,
            respect_gitignore: config.respect_gitignore,
            excluded_dirs: config.excluded_dirs.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the walker would emit `path` if it were found under the root
    pub fn is_excluded(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            self.excluded_dirs.iter().any(|d| *d == name)
                || (!self.include_hidden && name.starts_with('.') && name.len() > 1)
        })
    }

    /// Start a new walk from the root.
    pub fn walk(&self) -> FileWalk {
        let excluded = self.excluded_dirs.clone();
        let inner = ignore::WalkBuilder::new(&self.root)
            .hidden(!self.include_hidden)
            .git_ignore(self.respect_gitignore)
            .git_exclude(self.respect_gitignore)
            .git_global(false)
            .ignore(self.respect_gitignore)
            .require_git(false)
            .follow_links(false)
            .max_filesize(Some(self.max_file_bytes))
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                entry.depth() == 0
                    || !entry.file_type().is_some_and(|t| t.is_dir())
                    || !excluded
                        .iter()
                        .any(|d| entry.file_name().to_str() == Some(d.as_str()))
            })
            .build();

        FileWalk {
            inner,
            root: self.root.clone(),
        }
    }
}

/// Lazy sequence of the files of one walk
pub struct FileWalk {
    inner: ignore::Walk,
    root: PathBuf,
}

impl Iterator for FileWalk {
    type Item = Result<FileDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    return Some(Err(RetrieverError::Io(std::io::Error::other(
                        e.to_string(),
                    ))));
                }
            };

            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() || entry.path_is_symlink() {
                continue;
            }

            return Some(describe_file(&self.root, entry.path()));
        }
    }
}
