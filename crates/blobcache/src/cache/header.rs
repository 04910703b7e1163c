//! # Cache Header
//!
//! Binary header at offset 0 of every block cache file. All integers are
//! little-endian:
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 0      | 4    | magic `BLKC`     |
//! | 4      | 8    | format version   |
//! | 12     | 8    | block size       |
//! | 20     | 8    | file size        |
//! | 28     | 8    | bitmask capacity |
//! | 36     | n    | bitmask, `ceil(capacity / 8)` bytes |
//!
//! Block data starts right after the bitmask.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::BlobCacheError;
use crate::bitset::Bitset;

pub const CACHE_MAGIC: [u8; 4] = *b"BLKC";
pub const CACHE_VERSION: u64 = 1;
pub const HEADER_FIXED_LEN: usize = 36;

pub const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
/// 2^17 blocks, i.e. 1 TiB of 8 MiB blocks behind a 16 KiB bitmask.
pub const DEFAULT_BITMASK_CAPACITY: u64 = 1 << 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeader {
    pub version: u64,
    pub block_size: u64,
    pub file_size: u64,
    pub bitmask_capacity: u64,
    pub bitmask: Bitset,
}

impl CacheHeader {
    /// Empty header for a freshly created cache file.
    pub fn new(block_size: u64, bitmask_capacity: u64) -> Self {
        Self {
            version: CACHE_VERSION,
            block_size,
            file_size: 0,
            bitmask_capacity,
            bitmask: Bitset::new(bitmask_capacity),
        }
    }

    pub fn encoded_len_for(bitmask_capacity: u64) -> u64 {
        HEADER_FIXED_LEN as u64 + Bitset::byte_len(bitmask_capacity) as u64
    }

    /// Size of the header on disk, which is also the offset of block 0.
    pub fn encoded_len(&self) -> u64 {
        Self::encoded_len_for(self.bitmask_capacity)
    }

    pub fn block_count(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.block_size)
    }

    /// Logical length of block `index`; only the final block may be short.
    pub fn block_len(&self, index: u64) -> u64 {
        let start = index.saturating_mul(self.block_size);
        self.file_size.saturating_sub(start).min(self.block_size)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len() as usize);
        buf.put_slice(&CACHE_MAGIC);
        buf.put_u64_le(self.version);
        buf.put_u64_le(self.block_size);
        buf.put_u64_le(self.file_size);
        buf.put_u64_le(self.bitmask_capacity);
        buf.put_slice(self.bitmask.as_bytes());
        buf.freeze()
    }

    /// Parse the fixed part of the header and return the bitmask capacity it
    /// declares, so the caller knows how many bitmask bytes follow.
    pub fn peek_capacity(fixed: &[u8]) -> Result<u64, BlobCacheError> {
        let fields = FixedFields::parse(fixed)?;
        Ok(fields.bitmask_capacity)
    }

    /// Decode a full header, checking magic and version before anything else.
    pub fn decode(buf: &[u8]) -> Result<Self, BlobCacheError> {
        let fields = FixedFields::parse(buf)?;
        let bitmask_len = Bitset::byte_len(fields.bitmask_capacity);
        let available = buf.len() - HEADER_FIXED_LEN;
        if available < bitmask_len {
            return Err(BlobCacheError::InvalidFormat(format!(
                "truncated bitmask: {available} of {bitmask_len} bytes"
            )));
        }
        let bitmask = Bitset::from_bytes(
            buf[HEADER_FIXED_LEN..HEADER_FIXED_LEN + bitmask_len].to_vec(),
            fields.bitmask_capacity,
        )?;

        let header = Self {
            version: fields.version,
            block_size: fields.block_size,
            file_size: fields.file_size,
            bitmask_capacity: fields.bitmask_capacity,
            bitmask,
        };
        header.validate()?;
        Ok(header)
    }

    /// Check the header invariants.
    pub fn validate(&self) -> Result<(), BlobCacheError> {
        if self.version != CACHE_VERSION {
            return Err(BlobCacheError::UnsupportedVersion {
                found: self.version,
                expected: CACHE_VERSION,
            });
        }
        if self.block_size == 0 {
            return Err(BlobCacheError::HeaderInvariant(
                "block size is zero".to_string(),
            ));
        }
        let capacity_bytes = self
            .bitmask_capacity
            .checked_mul(self.block_size)
            .ok_or_else(|| {
                BlobCacheError::HeaderInvariant("capacity overflows u64".to_string())
            })?;
        if self.file_size > capacity_bytes {
            return Err(BlobCacheError::HeaderInvariant(format!(
                "file size {} exceeds capacity {capacity_bytes}",
                self.file_size
            )));
        }
        if self.bitmask.len() != self.bitmask_capacity {
            return Err(BlobCacheError::HeaderInvariant(format!(
                "bitmask holds {} bits, header declares {}",
                self.bitmask.len(),
                self.bitmask_capacity
            )));
        }
        Ok(())
    }
}

struct FixedFields {
    version: u64,
    block_size: u64,
    file_size: u64,
    bitmask_capacity: u64,
}

impl FixedFields {
    fn parse(buf: &[u8]) -> Result<Self, BlobCacheError> {
        if buf.len() < HEADER_FIXED_LEN {
            return Err(BlobCacheError::InvalidFormat(format!(
                "truncated header: {} of {HEADER_FIXED_LEN} bytes",
                buf.len()
            )));
        }
        if buf[..4] != CACHE_MAGIC {
            return Err(BlobCacheError::InvalidFormat(format!(
                "bad magic {:02x?}",
                &buf[..4]
            )));
        }
        let mut cursor = &buf[4..HEADER_FIXED_LEN];
        let version = cursor.get_u64_le();
        // A different version may lay out the rest differently.
        if version != CACHE_VERSION {
            return Err(BlobCacheError::UnsupportedVersion {
                found: version,
                expected: CACHE_VERSION,
            });
        }
        Ok(Self {
            version,
            block_size: cursor.get_u64_le(),
            file_size: cursor.get_u64_le(),
            bitmask_capacity: cursor.get_u64_le(),
        })
    }
}
