//! Poller subscription keys.
//!
//! Every controller registered with a [`PollSet`](crate::poll_set::PollSet)
//! needs a distinct key for its readiness events. Keys are recycled when a
//! controller set is rebuilt after a reconnect.

use anyhow::Result as Anyhow;
use bit_set::BitSet;

pub struct KeyAllocator {
    bitmap: BitSet,
    capacity: usize,
}

impl KeyAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            bitmap: BitSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the lowest free key, or an error when all keys are taken.
    pub fn allocate(&mut self) -> Anyhow<usize> {
        for key in 0..self.capacity {
            if !self.bitmap.contains(key) {
                self.bitmap.insert(key);
                return Ok(key);
            }
        }
        Err(anyhow::anyhow!(
            "All {} poller keys are in use",
            self.capacity
        ))
    }

    pub fn release(&mut self, key: usize) {
        self.bitmap.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_key_and_recycles() {
        let mut allocator = KeyAllocator::new(2);
        assert_eq!(allocator.allocate().unwrap(), 0);
        assert_eq!(allocator.allocate().unwrap(), 1);
        assert!(allocator.allocate().is_err());

        allocator.release(0);
        assert_eq!(allocator.allocate().unwrap(), 0);
    }
}
