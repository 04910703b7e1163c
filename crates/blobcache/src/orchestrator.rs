//! # Ordered Fetch Orchestrator
//!
//! Runs the tasks of one request concurrently on a [`WorkerPool`] while a
//! single walker emits them strictly in planned order. Submission and
//! emission are separate activities, so output starts streaming before
//! later ranges have finished.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::BlobCacheError;
use crate::pool::WorkerPool;
use crate::task::{OutputSender, Task};

#[derive(Debug, Clone, Copy)]
pub struct OrderedFetchOrchestrator {
    max_concurrency: usize,
}

impl OrderedFetchOrchestrator {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Execute `tasks` and forward their bytes to `output` in order.
    ///
    /// An empty chunk is sent before anything else. The first error stops
    /// the walker and cancels the tasks still running.
    pub async fn run(
        &self,
        tasks: Vec<Arc<dyn Task>>,
        output: &OutputSender,
        cancel: &CancellationToken,
    ) -> Result<(), BlobCacheError> {
        if tasks.is_empty() {
            return Ok(());
        }

        let cancel = cancel.child_token();
        let workers = tasks.len().min(self.max_concurrency);
        let pool = WorkerPool::new(workers, cancel.clone());
        debug!(tasks = tasks.len(), workers, "Starting ordered fetch");

        let submitter = {
            let tasks = tasks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut result = Ok(());
                for task in tasks {
                    if let Err(e) = pool.submit(task).await {
                        // Unsubmitted tasks never produce; stop their emitters.
                        cancel.cancel();
                        result = Err(e);
                        break;
                    }
                }
                pool.shutdown().await;
                result
            })
        };

        let mut result = if output.send(Ok(Bytes::new())).await.is_err() {
            Err(BlobCacheError::Cancelled)
        } else {
            Ok(())
        };

        if result.is_ok() {
            for task in &tasks {
                if let Err(e) = task.emit(output, &cancel).await {
                    let (start, end) = task.range();
                    if !e.is_cancelled() {
                        warn!(start, end, error = %e, "Range failed, aborting request");
                    }
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_err() {
            cancel.cancel();
        }

        let submitted = match submitter.await {
            Ok(submitted) => submitted,
            Err(e) => {
                warn!(error = %e, "Task submitter failed");
                Err(e.into())
            }
        };
        merge_outcomes(result, submitted)
    }
}

/// The walker's error wins, unless it only saw the cancellation that a
/// failed submission triggered.
fn merge_outcomes(
    walker: Result<(), BlobCacheError>,
    submitter: Result<(), BlobCacheError>,
) -> Result<(), BlobCacheError> {
    match (walker, submitter) {
        (Ok(()), submitted) => submitted,
        (Err(w), Err(s)) if w.is_cancelled() && !s.is_cancelled() => Err(s),
        (Err(w), _) => Err(w),
    }
}
