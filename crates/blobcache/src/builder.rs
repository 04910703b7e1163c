//! # Builder for AcceleratorConfig
//!
//! Fluent construction of [`AcceleratorConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use blobcache_engine::AcceleratorConfig;
//!
//! let config = AcceleratorConfig::builder()
//!     .with_cache_dir("/var/cache/blobcache")
//!     .with_block_size(8 * 1024 * 1024)
//!     .with_max_remote_range_size(32 * 1024 * 1024)
//!     .with_max_concurrency_per_file(8)
//!     .with_connect_timeout(Duration::from_secs(5))
//!     .with_header("X-Client", "mirror-01")
//!     .build();
//!
//! assert_eq!(config.max_concurrency_per_file, 8);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::config::{AcceleratorConfig, HttpClientConfig};

/// Builder for creating AcceleratorConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct AcceleratorConfigBuilder {
    config: AcceleratorConfig,
}

impl AcceleratorConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: AcceleratorConfig::default(),
        }
    }

    /// Set the root directory for cache files
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    /// Set the origin endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the cache block size in bytes
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Set the number of blocks the presence bitmask can track
    pub fn with_bitmask_capacity(mut self, capacity: u64) -> Self {
        self.config.bitmask_capacity = capacity;
        self
    }

    /// Set the largest single remote request, zero for unbounded
    pub fn with_max_remote_range_size(mut self, size: u64) -> Self {
        self.config.max_remote_range_size = size;
        self
    }

    /// Set the per-request concurrency limit
    pub fn with_max_concurrency_per_file(mut self, concurrency: usize) -> Self {
        self.config.max_concurrency_per_file = concurrency;
        self
    }

    /// Set the read-ahead block count and the prefetch cache capacity
    pub fn with_prefetch(mut self, lookahead_blocks: usize, cache_capacity: u64) -> Self {
        self.config.prefetch_blocks = lookahead_blocks;
        self.config.prefetch_cache_capacity = cache_capacity;
        self
    }

    /// Enable or disable peer routing
    pub fn with_cluster_enabled(mut self, enabled: bool) -> Self {
        self.config.cluster_enabled = enabled;
        self
    }

    /// Set the time budget for one peer-routing call
    pub fn with_routing_timeout(mut self, timeout: Duration) -> Self {
        self.config.routing_timeout = timeout;
        self
    }

    /// Set the progress channel capacity
    pub fn with_progress_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.progress_channel_capacity = capacity;
        self
    }

    /// Replace the whole HTTP client configuration
    pub fn with_http_config(mut self, http: HttpClientConfig) -> Self {
        self.config.http = http;
        self
    }

    /// Set the overall timeout for one HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.timeout = timeout;
        self
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.connect_timeout = timeout;
        self
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.read_timeout = timeout;
        self
    }

    /// Set whether to follow redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.http.follow_redirects = follow;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.http.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.http.headers.insert(name, value);
        }
        self
    }

    /// Merge headers into the defaults, replacing existing values
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.config.http.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Build the AcceleratorConfig instance
    pub fn build(self) -> AcceleratorConfig {
        self.config
    }
}

impl Default for AcceleratorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
