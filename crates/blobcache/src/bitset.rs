//! Fixed-capacity bit vector used as the block presence mask.

use crate::BlobCacheError;

/// A bit vector whose size is fixed at construction.
///
/// Bit `i` lives in byte `i / 8` at bit position `i % 8` (least significant
/// bit first), which is also its on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitset {
    bytes: Vec<u8>,
    size: u64,
}

impl Bitset {
    /// Create a bit vector of `size` cleared bits.
    pub fn new(size: u64) -> Self {
        Self {
            bytes: vec![0; Self::byte_len(size)],
            size,
        }
    }

    /// Rebuild a bit vector from its raw bytes.
    ///
    /// `bytes` must be exactly `ceil(size / 8)` long.
    pub fn from_bytes(bytes: Vec<u8>, size: u64) -> Result<Self, BlobCacheError> {
        let expected = Self::byte_len(size);
        if bytes.len() != expected {
            return Err(BlobCacheError::InvalidFormat(format!(
                "bitmask is {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        Ok(Self { bytes, size })
    }

    /// Number of backing bytes for `size` bits.
    pub fn byte_len(size: u64) -> usize {
        size.div_ceil(8) as usize
    }

    pub fn set(&mut self, index: u64) -> Result<(), BlobCacheError> {
        let (byte, mask) = self.locate(index)?;
        self.bytes[byte] |= mask;
        Ok(())
    }

    pub fn clear(&mut self, index: u64) -> Result<(), BlobCacheError> {
        let (byte, mask) = self.locate(index)?;
        self.bytes[byte] &= !mask;
        Ok(())
    }

    pub fn test(&self, index: u64) -> Result<bool, BlobCacheError> {
        let (byte, mask) = self.locate(index)?;
        Ok(self.bytes[byte] & mask != 0)
    }

    /// Count set bits among the first `limit` bits.
    pub fn count_ones_before(&self, limit: u64) -> u64 {
        let limit = limit.min(self.size);
        let full_bytes = (limit / 8) as usize;
        let mut count: u64 = self.bytes[..full_bytes]
            .iter()
            .map(|b| b.count_ones() as u64)
            .sum();
        let remaining = limit % 8;
        if remaining > 0 {
            let mask = (1u8 << remaining) - 1;
            count += (self.bytes[full_bytes] & mask).count_ones() as u64;
        }
        count
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn locate(&self, index: u64) -> Result<(usize, u8), BlobCacheError> {
        if index >= self.size {
            return Err(BlobCacheError::OutOfRange {
                index,
                size: self.size,
            });
        }
        Ok(((index / 8) as usize, 1u8 << (index % 8)))
    }
}
