//! # Block Cache File
//!
//! A persistent cache file holding one remote blob as fixed-size blocks behind
//! a [`CacheHeader`]. Presence of each block is one bit of the header bitmask,
//! and the header is always rewritten in place at offset 0.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use moka::sync::Cache as MokaCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace, warn};

#[cfg(target_family = "unix")]
use std::os::unix::fs::FileExt;
#[cfg(target_family = "windows")]
use std::os::windows::fs::FileExt;

use super::header::{
    CacheHeader, DEFAULT_BITMASK_CAPACITY, DEFAULT_BLOCK_SIZE, HEADER_FIXED_LEN,
};
use crate::BlobCacheError;
use crate::config::AcceleratorConfig;
use crate::locks::StripedLocks;
use crate::planner::BlockPresence;

/// Parameters used when opening or creating a cache file
#[derive(Debug, Clone)]
pub struct CacheFileOptions {
    /// Block size for newly created files; existing files keep their own
    pub block_size: u64,
    /// Bitmask capacity every cache file must carry
    pub bitmask_capacity: u64,
    /// Present blocks read ahead after a cache read
    pub prefetch_blocks: usize,
    /// Blocks held in the in-memory prefetch cache
    pub prefetch_cache_capacity: u64,
}

impl Default for CacheFileOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            bitmask_capacity: DEFAULT_BITMASK_CAPACITY,
            prefetch_blocks: 4,
            prefetch_cache_capacity: 8,
        }
    }
}

impl From<&AcceleratorConfig> for CacheFileOptions {
    fn from(config: &AcceleratorConfig) -> Self {
        Self {
            block_size: config.block_size,
            bitmask_capacity: config.bitmask_capacity,
            prefetch_blocks: config.prefetch_blocks,
            prefetch_cache_capacity: config.prefetch_cache_capacity,
        }
    }
}

/// Result of [`BlockCacheFile::write_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The block was written and marked present
    Written,
    /// Another writer already persisted this block
    AlreadyPresent,
}

/// Snapshot of a cache file's header and population
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheFileStats {
    pub version: u64,
    pub block_size: u64,
    pub file_size: u64,
    pub bitmask_capacity: u64,
    pub block_count: u64,
    pub present_blocks: u64,
}

impl From<&CacheHeader> for CacheFileStats {
    fn from(header: &CacheHeader) -> Self {
        let block_count = header.block_count();
        Self {
            version: header.version,
            block_size: header.block_size,
            file_size: header.file_size,
            bitmask_capacity: header.bitmask_capacity,
            block_count,
            present_blocks: header.bitmask.count_ones_before(block_count),
        }
    }
}

impl CacheFileStats {
    pub fn fill_rate(&self) -> f64 {
        if self.block_count == 0 {
            return 0.0;
        }
        (self.present_blocks as f64 / self.block_count as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.present_blocks == self.block_count
    }
}

pub struct BlockCacheFile {
    path: PathBuf,
    /// `None` once closed.
    file: RwLock<Option<File>>,
    /// Guards every read-modify-write of header fields.
    header: Mutex<CacheHeader>,
    header_len: u64,
    prefetch: MokaCache<u64, Bytes>,
    prefetch_blocks: usize,
    block_locks: StripedLocks,
}

impl BlockCacheFile {
    /// Open an existing cache file, or create it with an empty header.
    pub fn open(path: impl AsRef<Path>, options: &CacheFileOptions) -> Result<Self, BlobCacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let on_disk_len = file.metadata()?.len();

        let header = if on_disk_len == 0 {
            let header = CacheHeader::new(options.block_size, options.bitmask_capacity);
            header.validate()?;
            write_all_at(&file, &header.encode(), 0)?;
            debug!(
                path = %path.display(),
                block_size = header.block_size,
                capacity = header.bitmask_capacity,
                "Created cache file"
            );
            header
        } else {
            let header = read_header(&file, Some(options.bitmask_capacity))?;
            if header.block_size != options.block_size {
                debug!(
                    path = %path.display(),
                    file_block_size = header.block_size,
                    configured_block_size = options.block_size,
                    "Cache file keeps its own block size"
                );
            }
            let expected_len = header.encoded_len().checked_add(header.file_size);
            if expected_len.is_none_or(|expected_len| on_disk_len < expected_len) {
                return Err(BlobCacheError::InvalidFormat(format!(
                    "cache file is {on_disk_len} bytes, header requires {} + {}",
                    header.encoded_len(),
                    header.file_size
                )));
            }
            debug!(
                path = %path.display(),
                file_size = header.file_size,
                block_count = header.block_count(),
                present = header.bitmask.count_ones_before(header.block_count()),
                "Opened cache file"
            );
            header
        };

        let header_len = header.encoded_len();
        Ok(Self {
            path,
            file: RwLock::new(Some(file)),
            header: Mutex::new(header),
            header_len,
            prefetch: MokaCache::builder()
                .max_capacity(options.prefetch_cache_capacity.max(1))
                .build(),
            prefetch_blocks: options.prefetch_blocks,
            block_locks: StripedLocks::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current header.
    pub fn header(&self) -> CacheHeader {
        self.header.lock().clone()
    }

    pub fn block_size(&self) -> u64 {
        self.header.lock().block_size
    }

    pub fn file_size(&self) -> u64 {
        self.header.lock().file_size
    }

    pub fn block_count(&self) -> u64 {
        self.header.lock().block_count()
    }

    /// Whether block `index` has been persisted. Out-of-range indices are absent.
    pub fn has_block(&self, index: u64) -> bool {
        let header = self.header.lock();
        index < header.block_count() && header.bitmask.test(index).unwrap_or(false)
    }

    pub fn stats(&self) -> CacheFileStats {
        CacheFileStats::from(&*self.header.lock())
    }

    /// Read the header of an existing cache file without opening it for
    /// writing or checking it against any options.
    pub fn inspect(path: impl AsRef<Path>) -> Result<CacheFileStats, BlobCacheError> {
        let file = File::open(path.as_ref())?;
        let header = read_header(&file, None)?;
        Ok(CacheFileStats::from(&header))
    }

    pub fn is_closed(&self) -> bool {
        self.file.read().is_none()
    }

    /// Grow the logical file size. Shrinking is rejected.
    pub fn resize(&self, new_file_size: u64) -> Result<(), BlobCacheError> {
        self.with_file(|file| {
            let mut header = self.header.lock();
            if new_file_size < header.file_size {
                return Err(BlobCacheError::ShrinkRejected {
                    current: header.file_size,
                    requested: new_file_size,
                });
            }
            let capacity = header.bitmask_capacity.saturating_mul(header.block_size);
            if new_file_size > capacity {
                return Err(BlobCacheError::CapacityExceeded {
                    file_size: new_file_size,
                    capacity,
                });
            }
            if new_file_size == header.file_size {
                return Ok(());
            }

            // Sparse extension; absent blocks are never read.
            file.set_len(self.header_len + new_file_size)?;
            header.file_size = new_file_size;
            write_all_at(file, &header.encode(), 0)?;
            debug!(
                path = %self.path.display(),
                file_size = new_file_size,
                block_count = header.block_count(),
                "Resized cache file"
            );
            Ok(())
        })
    }

    /// Read block `index`, padded to the block size.
    ///
    /// Returns `Ok(None)` when the block is not present. A hit also reads up
    /// to `prefetch_blocks` following present blocks into the prefetch cache.
    pub fn read_block(&self, index: u64) -> Result<Option<Bytes>, BlobCacheError> {
        self.with_file(|file| {
            if let Some(block) = self.prefetch.get(&index) {
                trace!(block = index, "Prefetch cache hit");
                return Ok(Some(block));
            }

            let (block_size, file_size, run) = {
                let header = self.header.lock();
                let count = header.block_count();
                if index >= count {
                    return Err(BlobCacheError::OutOfRange { index, size: count });
                }
                if !header.bitmask.test(index)? {
                    return Ok(None);
                }
                let mut run = 1u64;
                while run <= self.prefetch_blocks as u64
                    && index + run < count
                    && header.bitmask.test(index + run)?
                {
                    run += 1;
                }
                (header.block_size, header.file_size, run)
            };

            let start = index * block_size;
            let end = ((index + run) * block_size).min(file_size);
            let mut buf = vec![0u8; (end - start) as usize];
            read_exact_at(file, &mut buf, self.header_len + start)?;
            let buf = Bytes::from(buf);

            let mut first = None;
            for k in 0..run {
                let offset = (k * block_size) as usize;
                let len = (block_size as usize).min(buf.len() - offset);
                let block = pad_block(buf.slice(offset..offset + len), block_size);
                if k == 0 {
                    first = Some(block);
                } else {
                    self.prefetch.insert(index + k, block);
                }
            }
            if run > 1 {
                trace!(block = index, prefetched = run - 1, "Prefetched following blocks");
            }
            Ok(first)
        })
    }

    /// Persist one full block and mark it present.
    ///
    /// `data` must be exactly one block long; for the final block only its
    /// logical length is written. Concurrent writers of the same block are
    /// serialized and the loser gets [`WriteOutcome::AlreadyPresent`].
    pub fn write_block(&self, index: u64, data: &[u8]) -> Result<WriteOutcome, BlobCacheError> {
        self.with_file(|file| {
            let (block_size, block_len) = {
                let header = self.header.lock();
                let count = header.block_count();
                if index >= count {
                    return Err(BlobCacheError::OutOfRange { index, size: count });
                }
                (header.block_size, header.block_len(index))
            };
            if data.len() as u64 != block_size {
                return Err(BlobCacheError::BlockSizeMismatch {
                    expected: block_size,
                    actual: data.len() as u64,
                });
            }

            let _block_guard = self.block_locks.lock(&index);
            if self.header.lock().bitmask.test(index)? {
                trace!(block = index, "Block already present, skipping write");
                return Ok(WriteOutcome::AlreadyPresent);
            }

            write_all_at(
                file,
                &data[..block_len as usize],
                self.header_len + index * block_size,
            )?;
            {
                let mut header = self.header.lock();
                header.bitmask.set(index)?;
                write_all_at(file, &header.encode(), 0)?;
            }
            self.prefetch.invalidate(&index);
            trace!(block = index, bytes = block_len, "Block persisted");
            Ok(WriteOutcome::Written)
        })
    }

    /// Rewrite the header and sync the file.
    pub fn flush(&self) -> Result<(), BlobCacheError> {
        self.with_file(|file| {
            let header = self.header.lock();
            write_all_at(file, &header.encode(), 0)?;
            file.sync_data()?;
            Ok(())
        })
    }

    /// Flush and release the file handle. Later operations fail with
    /// [`BlobCacheError::Closed`]. Returns `false` if already closed.
    pub fn close(&self) -> Result<bool, BlobCacheError> {
        let mut guard = self.file.write();
        let Some(file) = guard.take() else {
            return Ok(false);
        };
        self.prefetch.invalidate_all();
        let header = self.header.lock();
        write_all_at(&file, &header.encode(), 0)?;
        file.sync_data()?;
        debug!(path = %self.path.display(), "Closed cache file");
        Ok(true)
    }

    fn with_file<T>(
        &self,
        op: impl FnOnce(&File) -> Result<T, BlobCacheError>,
    ) -> Result<T, BlobCacheError> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(BlobCacheError::Closed)?;
        op(file)
    }

    #[cfg(test)]
    pub(crate) fn is_prefetched(&self, index: u64) -> bool {
        self.prefetch.contains_key(&index)
    }
}

impl BlockPresence for BlockCacheFile {
    fn block_size(&self) -> u64 {
        BlockCacheFile::block_size(self)
    }

    fn file_size(&self) -> u64 {
        BlockCacheFile::file_size(self)
    }

    fn has_block(&self, index: u64) -> bool {
        BlockCacheFile::has_block(self, index)
    }
}

impl Drop for BlockCacheFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "Failed to close cache file on drop");
        }
    }
}

fn read_header(file: &File, expected_capacity: Option<u64>) -> Result<CacheHeader, BlobCacheError> {
    let mut fixed = [0u8; HEADER_FIXED_LEN];
    read_exact_at(file, &mut fixed, 0).map_err(|e| match e {
        BlobCacheError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            BlobCacheError::InvalidFormat("truncated header".to_string())
        }
        other => other,
    })?;
    let capacity = CacheHeader::peek_capacity(&fixed)?;
    if let Some(expected_capacity) = expected_capacity
        && capacity != expected_capacity
    {
        return Err(BlobCacheError::InvalidFormat(format!(
            "bitmask capacity {capacity}, expected {expected_capacity}"
        )));
    }
    let header_len = CacheHeader::encoded_len_for(capacity);
    let on_disk_len = file.metadata()?.len();
    if header_len > on_disk_len {
        return Err(BlobCacheError::InvalidFormat(format!(
            "header declares a {header_len} byte bitmask header, file is {on_disk_len} bytes"
        )));
    }
    let mut buf = vec![0u8; header_len as usize];
    read_exact_at(file, &mut buf, 0).map_err(|e| match e {
        BlobCacheError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            BlobCacheError::InvalidFormat("truncated bitmask".to_string())
        }
        other => other,
    })?;
    CacheHeader::decode(&buf)
}

fn pad_block(data: Bytes, block_size: u64) -> Bytes {
    if data.len() as u64 == block_size {
        return data;
    }
    let mut padded = BytesMut::zeroed(block_size as usize);
    padded[..data.len()].copy_from_slice(&data);
    padded.freeze()
}

#[cfg(target_family = "unix")]
fn read_file_at(file: &File, out: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.read_at(out, offset)
}

#[cfg(target_family = "windows")]
fn read_file_at(file: &File, out: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.seek_read(out, offset)
}

#[cfg(target_family = "unix")]
fn write_file_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    file.write_at(data, offset)
}

#[cfg(target_family = "windows")]
fn write_file_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    file.seek_write(data, offset)
}

fn read_exact_at(file: &File, out: &mut [u8], offset: u64) -> Result<(), BlobCacheError> {
    let mut filled = 0usize;
    while filled < out.len() {
        let count = read_file_at(file, &mut out[filled..], offset + filled as u64)?;
        if count == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read from cache file",
            )
            .into());
        }
        filled += count;
    }
    Ok(())
}

fn write_all_at(file: &File, data: &[u8], offset: u64) -> Result<(), BlobCacheError> {
    let mut written = 0usize;
    while written < data.len() {
        let count = write_file_at(file, &data[written..], offset + written as u64)?;
        if count == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write cache file",
            )
            .into());
        }
        written += count;
    }
    Ok(())
}
