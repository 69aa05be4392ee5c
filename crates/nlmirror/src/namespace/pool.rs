//! Compact index allocation with reuse of freed slots.

use std::collections::BTreeSet;

/// Hands out small integer indices, always reusing the lowest freed one.
#[derive(Debug, Default)]
pub struct IndexPool {
    next: usize,
    free: BTreeSet<usize>,
}

impl IndexPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an index not currently in use.
    pub fn alloc(&mut self) -> usize {
        if let Some(index) = self.free.pop_first() {
            return index;
        }
        let index = self.next;
        self.next += 1;
        index
    }

    /// Return `index` to the pool. Freeing an index that is not allocated
    /// is ignored.
    pub fn free(&mut self, index: usize) {
        if index < self.next {
            self.free.insert(index);
        }
    }

    /// True if `index` is currently allocated.
    pub fn is_allocated(&self, index: usize) -> bool {
        index < self.next && !self.free.contains(&index)
    }

    /// Number of allocated indices.
    pub fn len(&self) -> usize {
        self.next - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
