/*!
 * Allocation Cache
 * Fixed array of quantum-count-indexed free-list buckets
 *
 * Bucket k (1 <= k < maximum_quanta) holds only free blocks of exactly
 * k quanta. Bucket 0 is the catch-all: blocks of maximum_quanta or
 * more, including retired subzone tails. The cache is a container
 * only; bucket selection policy lives with the admin.
 */

use crate::heap::freelist::FreeList;

pub(crate) struct AllocationCache {
    buckets: Box<[FreeList]>,
}

impl AllocationCache {
    pub(crate) fn new(cache_size: usize) -> AllocationCache {
        AllocationCache {
            buckets: vec![FreeList::new(); cache_size].into_boxed_slice(),
        }
    }

    pub(crate) fn cache_size(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket index for a free block of `n` quanta
    pub(crate) fn bucket_for(&self, n: usize) -> usize {
        let maximum_quanta = self.buckets.len() - 1;
        if n < maximum_quanta {
            n
        } else {
            0
        }
    }

    pub(crate) fn bucket(&self, k: usize) -> &FreeList {
        &self.buckets[k]
    }

    pub(crate) fn bucket_mut(&mut self, k: usize) -> &mut FreeList {
        &mut self.buckets[k]
    }

    pub(crate) fn buckets(&self) -> impl Iterator<Item = (usize, &FreeList)> {
        self.buckets.iter().enumerate()
    }
}
