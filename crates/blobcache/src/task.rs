//! # Tasks
//!
//! A task is one planned sub-range. [`Task::execute`] produces its bytes
//! into a private queue; [`Task::emit`] drains that queue to the request's
//! output. The two run on different activities, so a task can be fetching
//! while an earlier one is still being emitted.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::BlobCacheError;
use crate::cache::BlockCacheFile;
use crate::fetcher::{RemoteJob, RemoteRangeFetcher};
use crate::identity::FileIdentity;
use crate::planner::{PlannedRange, RangeKind, RemoteSource};
use crate::progress::{ProgressReporter, RangeProgress, RangeStatus};

/// Chunks of the request's output stream
pub type OutputSender = mpsc::Sender<Result<Bytes, BlobCacheError>>;

/// A trait for units of work executed by the worker pool
#[async_trait]
pub trait Task: Send + Sync {
    /// The `[start, end)` range this task produces.
    fn range(&self) -> (u64, u64);

    /// The task's private result queue.
    fn output(&self) -> &TaskOutput;

    /// Produce the task's bytes into its private queue.
    async fn execute(&self, cancel: &CancellationToken) -> RangeStatus;

    /// Forward the task's bytes to `output` until it has produced all of them.
    async fn emit(
        &self,
        output: &OutputSender,
        cancel: &CancellationToken,
    ) -> Result<(), BlobCacheError> {
        self.output().drain_into(output, cancel).await
    }
}

/// Private queue between a task's execution and its emission.
///
/// The producer side is handed out once; the queue ends when the producer
/// records its outcome.
pub struct TaskOutput {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    outcome: Mutex<Option<Result<(), BlobCacheError>>>,
}

impl TaskOutput {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            outcome: Mutex::new(None),
        }
    }

    /// Take the producer side. `None` if the task already ran.
    pub fn producer(&self) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.tx.lock().take()
    }

    /// Record how execution ended and close the queue.
    pub fn finish(&self, producer: mpsc::UnboundedSender<Bytes>, outcome: Result<(), BlobCacheError>) {
        *self.outcome.lock() = Some(outcome);
        drop(producer);
    }

    /// Forward queued chunks until the producer finishes, then surface its
    /// error, if any.
    pub async fn drain_into(
        &self,
        output: &OutputSender,
        cancel: &CancellationToken,
    ) -> Result<(), BlobCacheError> {
        let mut rx = self.rx.lock().await;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BlobCacheError::Cancelled),
                next = rx.recv() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            if chunk.is_empty() {
                continue;
            }
            // A dropped receiver means the caller went away.
            output
                .send(Ok(chunk))
                .await
                .map_err(|_| BlobCacheError::Cancelled)?;
        }

        match self.outcome.lock().take() {
            Some(outcome) => outcome,
            None => Err(BlobCacheError::Internal(
                "task finished without an outcome".to_string(),
            )),
        }
    }
}

impl Default for TaskOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every task of one request
pub struct TaskContext {
    pub fetcher: Arc<RemoteRangeFetcher>,
    pub identity: FileIdentity,
    pub file_size: u64,
    /// `None` when the cache file could not be opened
    pub cache: Option<Arc<BlockCacheFile>>,
    pub progress: Arc<dyn ProgressReporter>,
}

impl TaskContext {
    /// Build the task for one planned range.
    pub fn task_for(self: &Arc<Self>, range: &PlannedRange) -> Arc<dyn Task> {
        match &range.kind {
            RangeKind::Cached => Arc::new(CacheTask::new(range.start, range.end, self.clone())),
            RangeKind::Remote(source) => Arc::new(RemoteTask::new(
                range.start,
                range.end,
                source.clone(),
                self.clone(),
            )),
        }
    }

    async fn fetch_remote(
        &self,
        start: u64,
        end: u64,
        source: &RemoteSource,
        cache: Option<&Arc<BlockCacheFile>>,
        sink: &mpsc::UnboundedSender<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<u64, BlobCacheError> {
        let job = RemoteJob {
            identity: &self.identity,
            file_size: self.file_size,
            start,
            end,
            source,
        };
        self.fetcher.fetch(&job, cache, sink, cancel).await
    }

    fn record(
        &self,
        start: u64,
        end: u64,
        source: &'static str,
        output: &TaskOutput,
        producer: mpsc::UnboundedSender<Bytes>,
        result: Result<(), BlobCacheError>,
    ) -> RangeStatus {
        let status = match &result {
            Ok(()) => RangeStatus::Completed,
            Err(e) if e.is_cancelled() => RangeStatus::Cancelled,
            Err(_) => RangeStatus::Failed,
        };
        self.progress.report(RangeProgress {
            start,
            end,
            status,
            source,
        });
        output.finish(producer, result);
        status
    }
}

fn already_executed(start: u64, end: u64) -> RangeStatus {
    warn!(start, end, "Task executed more than once");
    RangeStatus::Failed
}

/// Serves a fully cached range from the cache file
pub struct CacheTask {
    start: u64,
    end: u64,
    ctx: Arc<TaskContext>,
    output: TaskOutput,
}

impl CacheTask {
    pub fn new(start: u64, end: u64, ctx: Arc<TaskContext>) -> Self {
        Self {
            start,
            end,
            ctx,
            output: TaskOutput::new(),
        }
    }

    /// Re-slice cached blocks; on a cache failure fetch what is left directly.
    async fn run(
        &self,
        sink: &mpsc::UnboundedSender<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<(), BlobCacheError> {
        let Some(cache) = self.ctx.cache.as_ref() else {
            self.ctx
                .fetch_remote(self.start, self.end, &RemoteSource::Origin, None, sink, cancel)
                .await?;
            return Ok(());
        };

        let block_size = cache.block_size();
        let mut pos = self.start;
        let mut persist = true;
        while pos < self.end {
            if cancel.is_cancelled() {
                return Err(BlobCacheError::Cancelled);
            }

            let index = pos / block_size;
            let file = Arc::clone(cache);
            match tokio::task::spawn_blocking(move || file.read_block(index)).await? {
                Ok(Some(block)) => {
                    let block_start = index * block_size;
                    let stop = self.end.min(block_start + block_size);
                    let from = (pos - block_start) as usize;
                    let to = (stop - block_start) as usize;
                    sink.send(block.slice(from..to))
                        .map_err(|_| BlobCacheError::Cancelled)?;
                    pos = stop;
                }
                Ok(None) => {
                    warn!(block = index, "Planned block is absent, fetching directly");
                    break;
                }
                Err(e) if e.is_cache_error() => {
                    warn!(block = index, error = %e, "Cache read failed, fetching directly");
                    persist = false;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if pos < self.end {
            let cache = persist.then_some(cache);
            self.ctx
                .fetch_remote(pos, self.end, &RemoteSource::Origin, cache, sink, cancel)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Task for CacheTask {
    fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    fn output(&self) -> &TaskOutput {
        &self.output
    }

    async fn execute(&self, cancel: &CancellationToken) -> RangeStatus {
        let Some(producer) = self.output.producer() else {
            return already_executed(self.start, self.end);
        };
        let result = if cancel.is_cancelled() {
            Err(BlobCacheError::Cancelled)
        } else {
            self.run(&producer, cancel).await
        };
        self.ctx
            .record(self.start, self.end, "cache", &self.output, producer, result)
    }
}

/// Fetches a range from the origin or a peer
pub struct RemoteTask {
    start: u64,
    end: u64,
    source: RemoteSource,
    ctx: Arc<TaskContext>,
    output: TaskOutput,
}

impl RemoteTask {
    pub fn new(start: u64, end: u64, source: RemoteSource, ctx: Arc<TaskContext>) -> Self {
        Self {
            start,
            end,
            source,
            ctx,
            output: TaskOutput::new(),
        }
    }

    pub fn source(&self) -> &RemoteSource {
        &self.source
    }
}

#[async_trait]
impl Task for RemoteTask {
    fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    fn output(&self) -> &TaskOutput {
        &self.output
    }

    async fn execute(&self, cancel: &CancellationToken) -> RangeStatus {
        let Some(producer) = self.output.producer() else {
            return already_executed(self.start, self.end);
        };
        let result = if cancel.is_cancelled() {
            Err(BlobCacheError::Cancelled)
        } else {
            self.ctx
                .fetch_remote(
                    self.start,
                    self.end,
                    &self.source,
                    self.ctx.cache.as_ref(),
                    &producer,
                    cancel,
                )
                .await
                .map(|bytes| debug!(start = self.start, end = self.end, bytes, "Remote task done"))
        };
        self.ctx.record(
            self.start,
            self.end,
            self.source.label(),
            &self.output,
            producer,
            result,
        )
    }
}
