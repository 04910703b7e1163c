//! Fixed-size striped lock table.
//!
//! Keys hash onto one of a fixed number of shards, so lock storage never grows
//! with the key space and no entry ever has to be evicted.

use std::hash::{BuildHasher, Hash, RandomState};

use parking_lot::{Mutex, MutexGuard};

const DEFAULT_SHARDS: usize = 64;

pub struct StripedLocks {
    shards: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl StripedLocks {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    /// Lock the shard that owns `key`. Distinct keys may share a shard.
    pub fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        self.shards[idx].lock()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl Default for StripedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}
