//! Bounded packet id deduplication.
//!
//! Ids are reduced to the first 8 bytes of their BLAKE3 hash and held in a
//! fixed ring with a parallel set. Membership and eviction are both O(1);
//! the oldest id is forgotten first. A hash collision makes a fresh packet
//! look like a duplicate, which the relay tolerates.

use std::collections::HashSet;

/// 64-bit key for a packet id.
pub fn hash_id(id: &str) -> u64 {
    let hash = blake3::hash(id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// FIFO seen-set over hashed packet ids.
#[derive(Debug)]
pub struct DeduplicationCache {
    seen: HashSet<u64>,
    ring: Vec<Option<u64>>,
    write_index: usize,
}

impl DeduplicationCache {
    /// Cache holding at most `capacity` ids. A capacity of zero is raised
    /// to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            ring: vec![None; capacity],
            write_index: 0,
        }
    }

    /// Record `id`. Returns `true` if it had not been seen.
    pub fn check_and_insert(&mut self, id: &str) -> bool {
        let hash = hash_id(id);
        if self.seen.contains(&hash) {
            return false;
        }

        if let Some(evicted) = self.ring[self.write_index].replace(hash) {
            self.seen.remove(&evicted);
        }
        self.seen.insert(hash);
        self.write_index = (self.write_index + 1) % self.ring.len();
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(&hash_id(id))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.ring.iter_mut().for_each(|slot| *slot = None);
        self.write_index = 0;
    }
}
