//! Fixed-size pool of testbed node identifiers.
//!
//! Ids are handed out smallest-free-first so small fleets always map onto
//! nodes `0..n`, which keeps logs and fixtures reproducible.

use crate::id::NodeId;
use std::collections::BTreeSet;

/// Every node in the pool is already mapped to a live vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("all {capacity} testbed nodes are in use")]
pub struct Exhausted {
    pub capacity: u32,
}

/// Allocator for node ids in `[0, capacity)`.
#[derive(Debug, Clone)]
pub struct NodeAllocator {
    capacity: u32,
    free: BTreeSet<NodeId>,
}

impl NodeAllocator {
    /// Create a pool with every id in `[0, capacity)` free.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            free: (0..capacity).map(NodeId).collect(),
        }
    }

    /// Take the smallest free id.
    pub fn allocate(&mut self) -> Result<NodeId, Exhausted> {
        self.free.pop_first().ok_or(Exhausted {
            capacity: self.capacity,
        })
    }

    /// Return an id to the pool. Releasing a free id, or one outside the
    /// pool, is a no-op.
    pub fn release(&mut self, id: NodeId) {
        if id.0 < self.capacity {
            self.free.insert(id);
        }
    }

    /// Whether `id` is currently handed out.
    pub fn is_allocated(&self, id: NodeId) -> bool {
        id.0 < self.capacity && !self.free.contains(&id)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of ids currently handed out.
    pub fn in_use(&self) -> usize {
        self.capacity as usize - self.free.len()
    }

    /// Number of ids still available.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}
