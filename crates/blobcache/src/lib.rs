//! # Blobcache
//!
//! A block-granular caching accelerator for large remote blob downloads
//! (model and dataset files fetched over HTTP range requests).
//!
//! ## Features
//!
//! - Persistent block cache files with a fixed-capacity presence bitmask
//! - One shared, reference-counted cache handle per target file
//! - Range planning into cache-hit and cache-miss sub-ranges, with optional
//!   best-effort peer routing
//! - Bounded concurrent execution with strictly ordered output
//! - Remote fetches that persist whole blocks as they stream in

pub mod accelerator;
pub mod bitset;
pub mod builder;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod identity;
pub mod locks;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod routing;
pub mod task;

pub use accelerator::{BlobAccelerator, ByteStream, FetchRequest};
pub use bitset::Bitset;
pub use builder::AcceleratorConfigBuilder;
pub use cache::{
    BlockCacheFile, CacheFileLease, CacheFileOptions, CacheFileRegistry, CacheFileStats,
    CacheHeader, RegistryStats, WriteOutcome,
};
pub use client::create_client;
pub use config::{AcceleratorConfig, HttpClientConfig};
pub use error::BlobCacheError;
pub use fetcher::{
    BlockAssembler, INTERNAL_REQUEST_HEADER, RemoteJob, RemoteMetadata, RemoteRangeFetcher,
};
pub use identity::{FileIdentity, RepoType};
pub use orchestrator::OrderedFetchOrchestrator;
pub use planner::{
    BlockPresence, PlanRequest, PlannedRange, PositionAnalysis, RangeKind, RangePlanner,
    RemoteSource,
};
pub use pool::WorkerPool;
pub use progress::{
    ChannelProgressReporter, ProgressReporter, RangeProgress, RangeStatus, TracingProgressReporter,
};
pub use routing::{PeerRoute, PeerRouter, RouteQuery};
pub use task::{CacheTask, OutputSender, RemoteTask, Task, TaskContext, TaskOutput};
