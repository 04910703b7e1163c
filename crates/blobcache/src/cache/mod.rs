//! # Block Cache
//!
//! Persistent, block-granular cache files and the registry that shares one
//! open handle per file across concurrent requests.

// Module declarations
mod file;
mod header;
mod registry;

pub use file::{BlockCacheFile, CacheFileOptions, CacheFileStats, WriteOutcome};
pub use header::{
    CACHE_MAGIC, CACHE_VERSION, CacheHeader, DEFAULT_BITMASK_CAPACITY, DEFAULT_BLOCK_SIZE,
    HEADER_FIXED_LEN,
};
pub use registry::{CacheFileLease, CacheFileRegistry, RegistryStats};
