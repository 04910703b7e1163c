use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::cache::{DEFAULT_BITMASK_CAPACITY, DEFAULT_BLOCK_SIZE};

const DEFAULT_USER_AGENT: &str = concat!("blobcache/", env!("CARGO_PKG_VERSION"));

/// Default hub endpoint used as the origin for remote fetches
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Options for the outbound HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Overall timeout for a request, zero disables it
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            // Large blobs stream for a long time, so only the per-read timeout applies.
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpClientConfig::get_default_headers(),
        }
    }
}

impl HttpClientConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers
    }
}

/// Configuration for the accelerator and the cache files it manages
#[derive(Debug, Clone)]
pub struct AcceleratorConfig {
    /// Root directory for block cache files
    pub cache_dir: PathBuf,

    /// Origin endpoint that remote tasks fetch from
    pub endpoint: String,

    /// Size of one cache block in bytes
    pub block_size: u64,

    /// Number of blocks the presence bitmask can track
    pub bitmask_capacity: u64,

    /// Largest single remote request in bytes, zero means unbounded
    pub max_remote_range_size: u64,

    /// Upper bound of concurrently executing tasks for one request
    pub max_concurrency_per_file: usize,

    /// Present blocks read ahead after a cache read
    pub prefetch_blocks: usize,

    /// Number of blocks held by each file's prefetch cache
    pub prefetch_cache_capacity: u64,

    /// Whether this node is part of a multi-node deployment
    pub cluster_enabled: bool,

    /// Upper bound for one peer-routing call
    pub routing_timeout: Duration,

    /// Capacity of the progress reporting channel
    pub progress_channel_capacity: usize,

    /// Outbound HTTP client options
    pub http: HttpClientConfig,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("blobcache"),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            block_size: DEFAULT_BLOCK_SIZE,
            bitmask_capacity: DEFAULT_BITMASK_CAPACITY,
            max_remote_range_size: 64 * 1024 * 1024,
            max_concurrency_per_file: 4,
            prefetch_blocks: 4,
            prefetch_cache_capacity: 8,
            cluster_enabled: false,
            routing_timeout: Duration::from_secs(2),
            progress_channel_capacity: 256,
            http: HttpClientConfig::default(),
        }
    }
}

impl AcceleratorConfig {
    pub fn builder() -> crate::builder::AcceleratorConfigBuilder {
        crate::builder::AcceleratorConfigBuilder::new()
    }

    /// Check the values that would otherwise fail deep inside a request.
    pub fn validate(&self) -> Result<(), crate::BlobCacheError> {
        if self.block_size == 0 {
            return Err(crate::BlobCacheError::ConfigError(
                "block size must be greater than zero".to_string(),
            ));
        }
        if self.bitmask_capacity == 0 {
            return Err(crate::BlobCacheError::ConfigError(
                "bitmask capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_remote_range_size % self.block_size != 0 {
            return Err(crate::BlobCacheError::ConfigError(format!(
                "max remote range size {} must be a multiple of the block size {}",
                self.max_remote_range_size, self.block_size
            )));
        }
        if self.max_concurrency_per_file == 0 {
            return Err(crate::BlobCacheError::ConfigError(
                "max concurrency per file must be greater than zero".to_string(),
            ));
        }
        url::Url::parse(&self.endpoint)
            .map_err(|e| crate::BlobCacheError::UrlError(format!("{}: {e}", self.endpoint)))?;
        Ok(())
    }

    /// Largest file that fits in one cache file.
    pub fn max_file_size(&self) -> u64 {
        self.bitmask_capacity.saturating_mul(self.block_size)
    }
}
