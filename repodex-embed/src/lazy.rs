//! One-time, retrying model initialization shared by all callers of a provider.

use crate::error::{EmbedError, Result};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;

/// A model that is loaded on first use and then shared.
///
/// Concurrent callers that arrive before the model is ready wait on the same in-flight
/// load. A failed load leaves the cell empty, so a later call starts a fresh load.
pub(crate) struct LazyModel<M> {
    cell: OnceCell<Arc<M>>,
    attempts: AtomicU32,
}

impl<M> LazyModel<M> {
    pub(crate) fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            attempts: AtomicU32::new(0),
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// Total number of load attempts made so far.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Return the loaded model, loading it with up to `retries` extra attempts.
    ///
    /// Configuration errors are returned immediately; anything else is retried after
    /// `delay(attempt)` and finally reported as [`EmbedError::ModelInitialization`].
    pub(crate) async fn get_or_load<F, Fut, D>(
        &self,
        retries: u32,
        delay: D,
        load: F,
    ) -> Result<Arc<M>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<M>>,
        D: Fn(u32) -> Duration,
    {
        self.cell
            .get_or_try_init(|| async {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    self.attempts.fetch_add(1, Ordering::SeqCst);
                    match load().await {
                        Ok(model) => return Ok(Arc::new(model)),
                        Err(e @ EmbedError::InvalidConfig { .. }) => return Err(e),
                        Err(e) if attempt <= retries => {
                            tracing::warn!(attempt, error = %e, "model load failed, retrying");
                            tokio::time::sleep(delay(attempt)).await;
                        }
                        Err(e) => {
                            return Err(EmbedError::ModelInitialization {
                                attempts: attempt,
                                source: Box::new(e),
                            });
                        }
                    }
                }
            })
            .await
            .map(Arc::clone)
    }
}
