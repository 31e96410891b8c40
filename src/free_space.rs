// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The free-space allocator interface consumed by the merge core
//! (spec.md §6): `block_get(priority, node_size_blocks) -> disk_block`.
//! Block-device claim/release and real space accounting are out of scope
//! (spec.md's Non-goals) - this module only defines the collaborator
//! contract and a reference implementation for tests.

use crate::disk_block::DiskBlock;
use crate::error::Result;
use std::sync::atomic::{AtomicU32, Ordering};

/// The free-space collaborator. Allocations used by the merge engine
/// carry priority 0; higher priorities are reserved for foreground paths
/// this crate does not implement.
pub trait FreeSpaceAllocator: Send + Sync {
    /// Allocates `node_size_blocks` contiguous blocks and returns the
    /// identifier of the first one.
    fn block_get(&self, priority: u8, node_size_blocks: u32) -> Result<DiskBlock>;

    /// Releases a previously allocated block back to the pool.
    fn block_put(&self, disk_block: DiskBlock);
}

/// A bump allocator over a single virtual device, never reusing a
/// released block. Sufficient for tests and for driving the merge engine
/// in isolation; a real deployment would back this with an on-disk
/// freelist the way the source's `castle_freespace` does.
#[derive(Debug)]
pub struct InMemoryFreeSpace {
    device_id: u32,
    next_block: AtomicU32,
}

impl InMemoryFreeSpace {
    #[must_use]
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            // Block 0 is reserved so it can double as `DiskBlock::INVALID`.
            next_block: AtomicU32::new(1),
        }
    }
}

impl Default for InMemoryFreeSpace {
    fn default() -> Self {
        Self::new(1)
    }
}

impl FreeSpaceAllocator for InMemoryFreeSpace {
    fn block_get(&self, _priority: u8, node_size_blocks: u32) -> Result<DiskBlock> {
        let node_size_blocks = node_size_blocks.max(1);
        let first = self.next_block.fetch_add(node_size_blocks, Ordering::AcqRel);
        Ok(DiskBlock::new(self.device_id, first))
    }

    fn block_put(&self, _disk_block: DiskBlock) {
        // No reclamation: a bump allocator never reuses released blocks.
    }
}
