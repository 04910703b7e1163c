//! # Blob Accelerator
//!
//! Request entry point: acquires the shared cache file for a blob, plans the
//! requested range and streams the result in order.
//!
//! ## Example
//!
//! ```no_run
//! use blobcache_engine::{
//!     AcceleratorConfig, BlobAccelerator, CacheFileRegistry, FetchRequest, FileIdentity,
//!     RepoType, TracingProgressReporter,
//! };
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AcceleratorConfig::builder()
//!     .with_cache_dir("/var/cache/blobcache")
//!     .build();
//! let registry = CacheFileRegistry::new((&config).into());
//! let accelerator =
//!     BlobAccelerator::new(config, registry, None, Arc::new(TracingProgressReporter))?;
//!
//! let identity = FileIdentity::new(RepoType::Model, "acme", "llm", "model.safetensors");
//! let request = FetchRequest::new(identity, 20 << 20).with_range(0, 1 << 20);
//! let mut stream = accelerator.fetch(request, CancellationToken::new()).await?;
//! while let Some(chunk) = stream.next().await {
//!     let _bytes = chunk?;
//! }
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, instrument, warn};

use crate::cache::{CacheFileLease, CacheFileRegistry};
use crate::client::create_client;
use crate::config::AcceleratorConfig;
use crate::fetcher::RemoteRangeFetcher;
use crate::identity::FileIdentity;
use crate::orchestrator::OrderedFetchOrchestrator;
use crate::planner::{PlanRequest, RangePlanner, RemoteSource};
use crate::progress::ProgressReporter;
use crate::routing::PeerRouter;
use crate::task::{Task, TaskContext};
use crate::BlobCacheError;

const OUTPUT_CHANNEL_CAPACITY: usize = 16;

/// Ordered stream of a request's bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BlobCacheError>> + Send>>;

/// One client request for a byte range of a blob
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub identity: FileIdentity,
    pub file_size: u64,
    /// `start == end == 0` requests the whole file
    pub start: u64,
    pub end: u64,
    /// Forwarded by another node
    pub internal: bool,
}

impl FetchRequest {
    /// Request the whole file.
    pub fn new(identity: FileIdentity, file_size: u64) -> Self {
        Self {
            identity,
            file_size,
            start: 0,
            end: 0,
            internal: false,
        }
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// The concrete `[start, end)` this request covers.
    pub fn bounds(&self) -> Result<(u64, u64), BlobCacheError> {
        if self.start == 0 && self.end == 0 {
            return Ok((0, self.file_size));
        }
        if self.start >= self.end || self.end > self.file_size {
            return Err(BlobCacheError::InvalidRange {
                start: self.start,
                end: self.end,
                file_size: self.file_size,
            });
        }
        Ok((self.start, self.end))
    }
}

pub struct BlobAccelerator {
    config: Arc<AcceleratorConfig>,
    registry: Arc<CacheFileRegistry>,
    fetcher: Arc<RemoteRangeFetcher>,
    planner: Arc<RangePlanner>,
    orchestrator: OrderedFetchOrchestrator,
    progress: Arc<dyn ProgressReporter>,
}

impl BlobAccelerator {
    /// Build an accelerator with an HTTP client created from `config.http`.
    pub fn new(
        config: AcceleratorConfig,
        registry: Arc<CacheFileRegistry>,
        router: Option<Arc<dyn PeerRouter>>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self, BlobCacheError> {
        let client = create_client(&config.http)?;
        Self::with_client(config, client, registry, router, progress)
    }

    /// Build an accelerator around an existing HTTP client.
    pub fn with_client(
        config: AcceleratorConfig,
        client: Client,
        registry: Arc<CacheFileRegistry>,
        router: Option<Arc<dyn PeerRouter>>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self, BlobCacheError> {
        config.validate()?;

        let mut planner = RangePlanner::new(config.max_remote_range_size);
        match (config.cluster_enabled, router) {
            (true, Some(router)) => {
                planner = planner.with_router(router, config.routing_timeout);
            }
            (true, None) => warn!("Cluster mode enabled without a peer router"),
            (false, _) => {}
        }

        info!(
            cache_dir = %config.cache_dir.display(),
            endpoint = %config.endpoint,
            block_size = config.block_size,
            max_concurrency = config.max_concurrency_per_file,
            "Blob accelerator ready"
        );

        Ok(Self {
            fetcher: Arc::new(RemoteRangeFetcher::new(client, config.endpoint.clone())),
            orchestrator: OrderedFetchOrchestrator::new(config.max_concurrency_per_file),
            planner: Arc::new(planner),
            config: Arc::new(config),
            registry,
            progress,
        })
    }

    pub fn config(&self) -> &AcceleratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CacheFileRegistry> {
        &self.registry
    }

    pub fn fetcher(&self) -> &Arc<RemoteRangeFetcher> {
        &self.fetcher
    }

    /// Serve `request`, returning a stream of its bytes in file order.
    ///
    /// The stream starts with one empty chunk. An error mid-stream is the
    /// last item. Cancelling `cancel` or dropping the stream stops the work.
    #[instrument(skip_all, fields(file = %request.identity, start = request.start, end = request.end))]
    pub async fn fetch(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> Result<ByteStream, BlobCacheError> {
        let (start, end) = request.bounds()?;

        let path = request.identity.cache_path(&self.config.cache_dir)?;
        let registry = Arc::clone(&self.registry);
        let file_size = request.file_size;
        let acquired =
            tokio::task::spawn_blocking(move || registry.acquire(&path, file_size)).await?;
        let lease = match acquired {
            Ok(lease) => Some(lease),
            Err(e) if e.is_cache_error() || matches!(e, BlobCacheError::CapacityExceeded { .. }) => {
                warn!(error = %e, "Cache unavailable, serving directly from origin");
                None
            }
            Err(e) => return Err(e),
        };

        let ctx = Arc::new(TaskContext {
            fetcher: Arc::clone(&self.fetcher),
            identity: request.identity.clone(),
            file_size,
            cache: lease.as_ref().map(|lease| Arc::clone(lease.file())),
            progress: Arc::clone(&self.progress),
        });

        let planned = match &ctx.cache {
            Some(file) => {
                let plan = PlanRequest {
                    start,
                    end,
                    identity: &request.identity,
                    internal: request.internal,
                };
                self.planner.plan(file.as_ref(), &plan).await
            }
            None => Ok(self
                .planner
                .split_remote(start, end, self.config.block_size, RemoteSource::Origin)),
        };
        let ranges = match planned {
            Ok(ranges) => ranges,
            Err(e) => {
                drop(ctx);
                release(lease).await;
                return Err(e);
            }
        };
        let tasks: Vec<Arc<dyn Task>> = ranges.iter().map(|range| ctx.task_for(range)).collect();
        debug!(tasks = tasks.len(), cached = lease.is_some(), "Request planned");

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let orchestrator = self.orchestrator;
        tokio::spawn(
            async move {
                let result = orchestrator.run(tasks, &tx, &cancel).await;
                match result {
                    Ok(()) => debug!("Request finished"),
                    Err(e) if e.is_cancelled() => debug!("Request cancelled"),
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                    }
                }
                release(lease).await;
            }
            .in_current_span(),
        );

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Closing the last reference flushes the file, so drop it off the runtime.
async fn release(lease: Option<CacheFileLease>) {
    if let Some(lease) = lease
        && let Err(e) = tokio::task::spawn_blocking(move || drop(lease)).await
    {
        warn!(error = %e, "Failed to release cache file");
    }
}
