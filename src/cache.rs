// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The page cache interface consumed by the merge core (spec.md §6).
//!
//! The source exposes `block_get` / `set_uptodate` / `dirty` / `unlock` /
//! `put` as an explicit lock/unlock protocol. In Rust, a locked reference is
//! naturally a write guard whose `Drop` is the unlock - so [`BlockRef`] is
//! `Arc<RwLock<Node>>` and callers take `.write()`/`.read()` guards instead
//! of calling an explicit unlock.

use crate::btree::Node;
use crate::disk_block::DiskBlock;
use crate::error::Result;
use quick_cache::sync::Cache as QuickCache;
use quick_cache::{OptionsBuilder, UnitWeighter};
use std::sync::{Arc, RwLock};

pub type BlockRef = Arc<RwLock<Node>>;

/// The block cache / page cache collaborator.
///
/// Implementations must be safe to share across merge workers; the default
/// [`PageCache`] is backed by `quick_cache`, the same crate the teacher uses
/// for its own block cache.
pub trait PageCache: Send + Sync {
    /// Returns the cached block for `disk_block`, if present.
    fn get(&self, disk_block: DiskBlock) -> Option<BlockRef>;

    /// Inserts `node` as the cached block for a freshly allocated
    /// `disk_block` and returns the shared reference. `size_blocks` is
    /// informational (capacity planning) only; the cache does not itself
    /// enforce block sizing.
    fn insert(&self, disk_block: DiskBlock, size_blocks: u32, node: Node) -> BlockRef;

    /// Evicts `disk_block` from the cache, if present.
    fn put(&self, disk_block: DiskBlock);

    /// Returns the cached block for `disk_block`, creating it with
    /// `default()` if absent.
    fn block_get(
        &self,
        disk_block: DiskBlock,
        size_blocks: u32,
        default: Node,
    ) -> Result<BlockRef> {
        if let Some(existing) = self.get(disk_block) {
            return Ok(existing);
        }
        Ok(self.insert(disk_block, size_blocks, default))
    }
}

/// An in-memory page cache, sized by item count (quick_cache's
/// `UnitWeighter`), used by tests and as the crate's reference
/// implementation.
pub struct InMemoryCache {
    inner: QuickCache<DiskBlock, BlockRef, UnitWeighter, rustc_hash::FxBuildHasher>,
}

impl InMemoryCache {
    #[must_use]
    pub fn with_capacity(items: u64) -> Self {
        #[expect(clippy::expect_used, reason = "cache options are statically valid")]
        let opts = OptionsBuilder::new()
            .weight_capacity(items)
            .estimated_items_capacity(items as usize)
            .build()
            .expect("cache options should be valid");

        Self {
            inner: QuickCache::with_options(
                opts,
                UnitWeighter,
                rustc_hash::FxBuildHasher::default(),
                quick_cache::sync::DefaultLifecycle::default(),
            ),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl PageCache for InMemoryCache {
    fn get(&self, disk_block: DiskBlock) -> Option<BlockRef> {
        self.inner.get(&disk_block)
    }

    fn insert(&self, disk_block: DiskBlock, _size_blocks: u32, node: Node) -> BlockRef {
        let fresh: BlockRef = Arc::new(RwLock::new(node));
        self.inner.insert(disk_block, fresh.clone());
        fresh
    }

    fn put(&self, disk_block: DiskBlock) {
        self.inner.remove(&disk_block);
    }
}
