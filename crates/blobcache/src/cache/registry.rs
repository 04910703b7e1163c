//! # Cache File Registry
//!
//! Maps a cache file path to one shared, reference-counted [`BlockCacheFile`]
//! so that every concurrent request for the same blob observes the same
//! handle. Construct one registry per process and hand it to whatever serves
//! requests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::file::{BlockCacheFile, CacheFileOptions};
use crate::BlobCacheError;

struct Entry {
    file: Arc<BlockCacheFile>,
    refs: AtomicUsize,
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Paths that currently have an open handle
    pub open_entries: usize,
    /// Handles closed since the registry was created
    pub closed_total: u64,
}

pub struct CacheFileRegistry {
    entries: Mutex<HashMap<PathBuf, Arc<Entry>>>,
    options: CacheFileOptions,
    closed_total: AtomicU64,
}

impl CacheFileRegistry {
    pub fn new(options: CacheFileOptions) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            options,
            closed_total: AtomicU64::new(0),
        })
    }

    pub fn options(&self) -> &CacheFileOptions {
        &self.options
    }

    /// Take a reference on the cache file at `path`, opening it on first use.
    ///
    /// The logical file size is grown to `file_size` when it is larger than
    /// what the cache file records. This does blocking file I/O.
    pub fn acquire(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
        file_size: u64,
    ) -> Result<CacheFileLease, BlobCacheError> {
        let path = path.as_ref().to_path_buf();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(&path) {
            let refs = entry.refs.fetch_add(1, Ordering::AcqRel) + 1;
            let file = entry.file.clone();
            drop(entries);
            debug!(path = %path.display(), refs, "Reusing open cache file");

            let lease = CacheFileLease {
                registry: self.clone(),
                path,
                file,
            };
            if lease.file.file_size() < file_size {
                lease.file.resize(file_size)?;
            }
            return Ok(lease);
        }

        let file = BlockCacheFile::open(&path, &self.options)?;
        if file.file_size() < file_size {
            file.resize(file_size)?;
        }
        let file = Arc::new(file);
        entries.insert(
            path.clone(),
            Arc::new(Entry {
                file: file.clone(),
                refs: AtomicUsize::new(1),
            }),
        );
        debug!(path = %path.display(), file_size, "Registered cache file");

        Ok(CacheFileLease {
            registry: self.clone(),
            path,
            file,
        })
    }

    /// Whether `path` currently has an open entry.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.entries.lock().contains_key(path.as_ref())
    }

    /// Current reference count for `path`, zero when not open.
    pub fn ref_count(&self, path: impl AsRef<Path>) -> usize {
        self.entries
            .lock()
            .get(path.as_ref())
            .map(|entry| entry.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            open_entries: self.entries.lock().len(),
            closed_total: self.closed_total.load(Ordering::Relaxed),
        }
    }

    fn release(&self, path: &Path, file: &Arc<BlockCacheFile>) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(path) else {
            warn!(path = %path.display(), "Released a cache file that is not registered");
            return;
        };
        if !Arc::ptr_eq(&entry.file, file) {
            warn!(path = %path.display(), "Released a stale cache file handle");
            return;
        }

        let remaining = entry.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            debug!(path = %path.display(), refs = remaining, "Released cache file reference");
            return;
        }

        if let Some(entry) = entries.remove(path) {
            // Closed under the map lock so a reopen of the same path waits for the flush.
            match entry.file.close() {
                Ok(true) => {
                    self.closed_total.fetch_add(1, Ordering::Relaxed);
                    debug!(path = %path.display(), "Closed cache file after last release");
                }
                Ok(false) => {}
                Err(e) => {
                    self.closed_total.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %path.display(), error = %e, "Failed to flush cache file on close");
                }
            }
        }
    }
}

/// A counted reference to a registered cache file, released on drop.
pub struct CacheFileLease {
    registry: Arc<CacheFileRegistry>,
    path: PathBuf,
    file: Arc<BlockCacheFile>,
}

impl CacheFileLease {
    pub fn file(&self) -> &Arc<BlockCacheFile> {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::ops::Deref for CacheFileLease {
    type Target = BlockCacheFile;

    fn deref(&self) -> &Self::Target {
        &self.file
    }
}

impl std::fmt::Debug for CacheFileLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFileLease")
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for CacheFileLease {
    fn drop(&mut self) {
        self.registry.release(&self.path, &self.file);
    }
}
