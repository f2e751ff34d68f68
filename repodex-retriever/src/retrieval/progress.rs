//! Progress reporting for ingestion runs.
//!
//! The indexing engine calls an [`IngestObserver`] at fixed points of a run and knows nothing
//! else about how progress is displayed or recorded. Two observers are provided:
//!
//! - [`TracingObserver`] logs every event through `tracing`
//! - [`BufferedIngestLog`] batches events in a bounded queue and hands them to a [`LogSink`]
//!   when the queue fills up, when the flush interval has elapsed, on [`flush`], or when the
//!   session completes
//!
//! [`flush`]: BufferedIngestLog::flush

use super::indexing_engine::SessionSummary;
use crate::error::RetrieverError;
use crate::storage::Repository;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Callbacks made by the indexing engine during a run. All methods default to doing nothing.
///
/// Files are processed concurrently, so per-file callbacks for different files interleave.
pub trait IngestObserver: Send + Sync {
    fn on_session_start(&self, _repository: &Repository) {}
    fn on_file_start(&self, _path: &Path) {}
    fn on_file_done(&self, _path: &Path, _chunks: usize, _elapsed: Duration) {}
    fn on_file_skipped(&self, _path: &Path) {}
    fn on_file_error(&self, _path: &Path, _error: &RetrieverError) {}
    fn on_session_complete(&self, _summary: &SessionSummary) {}
}

/// Observer that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl IngestObserver for NoopObserver {}

/// Observer that logs every event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl IngestObserver for TracingObserver {
    fn on_session_start(&self, repository: &Repository) {
        info!(
            "Ingesting repository {} from {}",
            repository.name,
            repository.path.display()
        );
    }

    fn on_file_start(&self, path: &Path) {
        debug!(file = %path.display(), "Processing file");
    }

    fn on_file_done(&self, path: &Path, chunks: usize, elapsed: Duration) {
        info!(
            file = %path.display(),
            chunks,
            elapsed_ms = elapsed.as_millis() as u64,
            "Indexed file"
        );
    }

    fn on_file_skipped(&self, path: &Path) {
        debug!(file = %path.display(), "Skipped unchanged file");
    }

    fn on_file_error(&self, path: &Path, error: &RetrieverError) {
        warn!(file = %path.display(), kind = ?error.kind(), "Failed to index file: {}", error);
    }

    fn on_session_complete(&self, summary: &SessionSummary) {
        info!(
            processed = summary.files_processed,
            skipped = summary.files_skipped,
            failed = summary.files_failed,
            removed = summary.files_removed,
            chunks = summary.total_chunks,
            "Ingestion finished in {:.2}s",
            summary.duration.as_secs_f64()
        );
    }
}

/// Forward every event to both observers.
impl<A: IngestObserver, B: IngestObserver> IngestObserver for (A, B) {
    fn on_session_start(&self, repository: &Repository) {
        self.0.on_session_start(repository);
        self.1.on_session_start(repository);
    }

    fn on_file_start(&self, path: &Path) {
        self.0.on_file_start(path);
        self.1.on_file_start(path);
    }

    fn on_file_done(&self, path: &Path, chunks: usize, elapsed: Duration) {
        self.0.on_file_done(path, chunks, elapsed);
        self.1.on_file_done(path, chunks, elapsed);
    }

    fn on_file_skipped(&self, path: &Path) {
        self.0.on_file_skipped(path);
        self.1.on_file_skipped(path);
    }

    fn on_file_error(&self, path: &Path, error: &RetrieverError) {
        self.0.on_file_error(path, error);
        self.1.on_file_error(path, error);
    }

    fn on_session_complete(&self, summary: &SessionSummary) {
        self.0.on_session_complete(summary);
        self.1.on_session_complete(summary);
    }
}

/// One recorded progress event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    SessionStart {
        repository_id: String,
        name: String,
    },
    FileStart {
        path: PathBuf,
    },
    FileDone {
        path: PathBuf,
        chunks: usize,
        elapsed_ms: u64,
    },
    FileSkipped {
        path: PathBuf,
    },
    FileError {
        path: PathBuf,
        message: String,
    },
    SessionComplete {
        files_processed: usize,
        files_skipped: usize,
        files_failed: usize,
        total_chunks: usize,
        duration_ms: u64,
    },
}

/// Destination of flushed event batches
pub trait LogSink: Send + Sync {
    fn write_batch(&self, events: &[IngestEvent]);
}

/// Appends events to a file, one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    file: Mutex<std::fs::File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LogSink for JsonLinesSink {
    fn write_batch(&self, events: &[IngestEvent]) {
        let mut buf = Vec::new();
        for event in events {
            if serde_json::to_writer(&mut buf, event).is_ok() {
                buf.push(b'\n');
            }
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(&buf).and_then(|()| file.flush()) {
            warn!("Failed to write ingestion log: {}", e);
        }
    }
}

#[derive(Debug)]
struct BufferState {
    events: VecDeque<IngestEvent>,
    last_flush: Instant,
}

/// Observer that batches events and flushes them to a sink.
#[derive(Debug)]
pub struct BufferedIngestLog<S: LogSink> {
    sink: S,
    capacity: usize,
    flush_interval: Duration,
    state: Mutex<BufferState>,
}

impl<S: LogSink> BufferedIngestLog<S> {
    pub fn new(sink: S, capacity: usize, flush_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            sink,
            capacity,
            flush_interval,
            state: Mutex::new(BufferState {
                events: VecDeque::with_capacity(capacity),
                last_flush: Instant::now(),
            }),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Number of events waiting to be flushed
    pub fn pending(&self) -> usize {
        self.lock().events.len()
    }

    /// Hand every buffered event to the sink now.
    pub fn flush(&self) {
        let mut batch = {
            let mut state = self.lock();
            state.last_flush = Instant::now();
            std::mem::take(&mut state.events)
        };
        if !batch.is_empty() {
            self.sink.write_batch(batch.make_contiguous());
        }
    }

    fn push(&self, event: IngestEvent) {
        let due = {
            let mut state = self.lock();
            state.events.push_back(event);
            state.events.len() >= self.capacity
                || state.last_flush.elapsed() >= self.flush_interval
        };
        if due {
            self.flush();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: LogSink> IngestObserver for BufferedIngestLog<S> {
    fn on_session_start(&self, repository: &Repository) {
        self.push(IngestEvent::SessionStart {
            repository_id: repository.id.clone(),
            name: repository.name.clone(),
        });
    }

    fn on_file_start(&self, path: &Path) {
        self.push(IngestEvent::FileStart {
            path: path.to_path_buf(),
        });
    }

    fn on_file_done(&self, path: &Path, chunks: usize, elapsed: Duration) {
        self.push(IngestEvent::FileDone {
            path: path.to_path_buf(),
            chunks,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    fn on_file_skipped(&self, path: &Path) {
        self.push(IngestEvent::FileSkipped {
            path: path.to_path_buf(),
        });
    }

    fn on_file_error(&self, path: &Path, error: &RetrieverError) {
        self.push(IngestEvent::FileError {
            path: path.to_path_buf(),
            message: error.to_string(),
        });
    }

    fn on_session_complete(&self, summary: &SessionSummary) {
        self.push(IngestEvent::SessionComplete {
            files_processed: summary.files_processed,
            files_skipped: summary.files_skipped,
            files_failed: summary.files_failed,
            total_chunks: summary.total_chunks,
            duration_ms: summary.duration.as_millis() as u64,
        });
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[derive(Default, Clone)]
    struct Collected(Arc<Mutex<Vec<Vec<IngestEvent>>>>);

    impl LogSink for Collected {
        fn write_batch(&self, events: &[IngestEvent]) {
            self.0.lock().unwrap().push(events.to_vec());
        }
    }

    impl Collected {
        fn batch_sizes(&self) -> Vec<usize> {
            self.0.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[test]
    fn test_flushes_at_capacity() {
        let sink = Collected::default();
        let log = BufferedIngestLog::new(sink.clone(), 3, Duration::from_secs(3600));

        for i in 0..7 {
            log.on_file_skipped(Path::new(&format!("f{i}.rs")));
        }
        assert_eq!(sink.batch_sizes(), vec![3, 3]);
        assert_eq!(log.pending(), 1);

        log.flush();
        assert_eq!(sink.batch_sizes(), vec![3, 3, 1]);
        assert_eq!(log.pending(), 0);

        // Nothing buffered, nothing written.
        log.flush();
        assert_eq!(sink.batch_sizes().len(), 3);
    }

    #[test]
    fn test_flushes_after_interval() {
        let sink = Collected::default();
        let log = BufferedIngestLog::new(sink.clone(), 100, Duration::ZERO);

        log.on_file_start(Path::new("a.rs"));
        log.on_file_done(Path::new("a.rs"), 2, Duration::from_millis(5));
        assert_eq!(sink.batch_sizes(), vec![1, 1]);
    }

    #[test]
    fn test_session_complete_flushes() {
        let sink = Collected::default();
        let log = BufferedIngestLog::new(sink.clone(), 100, Duration::from_secs(3600));

        log.on_file_done(Path::new("a.rs"), 1, Duration::from_millis(1));
        log.on_session_complete(&SessionSummary::default());

        let batches = sink.0.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert!(matches!(batches[0][1], IngestEvent::SessionComplete { .. }));
    }

    #[test]
    fn test_json_lines_sink() -> crate::error::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("logs").join("ingest.jsonl");
        let log = BufferedIngestLog::new(JsonLinesSink::open(&path)?, 10, Duration::from_secs(60));

        log.on_file_error(
            Path::new("bad.rs"),
            &RetrieverError::invalid_params("content", "boom"),
        );
        log.on_file_skipped(Path::new("same.rs"));
        log.flush();

        let text = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "file_error");
        assert_eq!(first["path"], "bad.rs");
        Ok(())
    }

    #[traced_test]
    #[test]
    fn test_tracing_observer_logs() {
        TracingObserver.on_file_done(Path::new("src/lib.rs"), 4, Duration::from_millis(12));
        assert!(logs_contain("Indexed file"));
        assert!(logs_contain("chunks=4"));
    }

    #[test]
    fn test_pair_forwards_to_both() {
        let a = Collected::default();
        let b = Collected::default();
        let pair = (
            BufferedIngestLog::new(a.clone(), 1, Duration::from_secs(60)),
            BufferedIngestLog::new(b.clone(), 1, Duration::from_secs(60)),
        );
        pair.on_file_skipped(Path::new("x.rs"));
        assert_eq!(a.batch_sizes(), vec![1]);
        assert_eq!(b.batch_sizes(), vec![1]);
    }
}
