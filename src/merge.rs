// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The Merge Engine (spec.md §4.7): consumes a merged iterator and produces
//! one new immutable B-tree CT. This is a close translation of
//! `castle_da_entry_add` / `castle_da_node_complete` / `castle_da_nodes_complete`
//! / `castle_da_merge_complete` (`examples/original_source/kernel/castle_da.c`,
//! roughly lines 627-835): per-entry cut-rule bookkeeping at depth 0, a
//! recursive node-completion cascade that propagates one pivot per completed
//! node to the depth above, and a final end-of-stream flush. The source's
//! per-level scratch `buffer` is folded into a local `Vec<Entry>` here rather
//! than a persistent field, since Rust's ownership makes a short-lived local
//! both simpler and exactly as safe.

use crate::btree::{BTreeType, Entry, Key, Node};
use crate::cache::{BlockRef, PageCache};
use crate::disk_block::DiskBlock;
use crate::error::{Error, Result};
use crate::free_space::FreeSpaceAllocator;
use crate::merged_iter::MergedIterator;
use crate::version::{VersionId, VersionIndex};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// Per-depth work state (spec.md §4.7).
struct LevelState {
    node_block: Option<DiskBlock>,
    node_ref: Option<BlockRef>,
    /// Next write index; `-1` means "full, completion pending".
    next_slot: i64,
    last_key: Key,
    /// Largest slot index at which the node may be closed; `-1` if none yet.
    valid_end_idx: i64,
    valid_version: VersionId,
}

impl LevelState {
    fn fresh() -> Self {
        Self {
            node_block: None,
            node_ref: None,
            next_slot: 0,
            last_key: Vec::new(),
            valid_end_idx: -1,
            valid_version: 0,
        }
    }
}

/// The descriptor of a freshly built, immutable CT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeResult {
    pub first_node: DiskBlock,
    pub last_node: DiskBlock,
    pub node_count: u64,
    pub item_count: u64,
}

/// Outcome of a merge run: either a completed CT, or an abandonment
/// (spec.md §5: "a merge can only be abandoned between nodes").
pub enum MergeOutcome {
    Completed(MergeResult),
    Abandoned,
}

struct MergeEngine<'a> {
    btree: &'a dyn BTreeType,
    cache: &'a dyn PageCache,
    free_space: &'a dyn FreeSpaceAllocator,
    versions: &'a VersionIndex,
    levels: Vec<LevelState>,
    item_count: u64,
    node_count: u64,
    max_depth_used: Option<usize>,
    allocated_blocks: Vec<DiskBlock>,
    completed_since_last_check: bool,
}

impl<'a> MergeEngine<'a> {
    fn new(
        btree: &'a dyn BTreeType,
        cache: &'a dyn PageCache,
        free_space: &'a dyn FreeSpaceAllocator,
        versions: &'a VersionIndex,
        max_depth: usize,
    ) -> Self {
        Self {
            btree,
            cache,
            free_space,
            versions,
            levels: (0..max_depth).map(|_| LevelState::fresh()).collect(),
            item_count: 0,
            node_count: 0,
            max_depth_used: None,
            allocated_blocks: Vec::new(),
            completed_since_last_check: false,
        }
    }

    fn release_allocated(&self) {
        for block in &self.allocated_blocks {
            self.free_space.block_put(*block);
        }
    }

    fn alloc_fresh_node(&mut self, depth: usize, is_leaf: bool) -> Result<()> {
        let block = self.free_space.block_get(0, self.btree.node_size())?;
        self.allocated_blocks.push(block);
        let node = Node::new(self.btree.magic(), 0, is_leaf);
        let node_ref = self.cache.insert(block, self.btree.node_size(), node);

        let level = &mut self.levels[depth];
        level.node_block = Some(block);
        level.node_ref = Some(node_ref);
        level.next_slot = 0;
        level.last_key = Vec::new();
        level.valid_end_idx = -1;
        level.valid_version = 0;

        self.node_count += 1;
        self.max_depth_used = Some(self.max_depth_used.map_or(depth, |d| d.max(depth)));
        Ok(())
    }

    fn ensure_node(&mut self, depth: usize, is_leaf: bool) -> Result<()> {
        if self.levels[depth].node_block.is_none() {
            self.alloc_fresh_node(depth, is_leaf)?;
        }
        Ok(())
    }

    /// Applies cases A-D to the entry just appended at `slot_index`.
    fn record_entry(&mut self, depth: usize, slot_index: usize, key: &Key, version: VersionId) -> Result<()> {
        if slot_index == 0 {
            let level = &mut self.levels[depth];
            level.valid_end_idx = 0;
            level.valid_version = version;
            level.last_key = key.clone();
            return Ok(());
        }

        let key_order = self.btree.key_compare(key, &self.levels[depth].last_key);
        match key_order {
            Ordering::Less => Err(Error::InvalidInput(
                "merge input is not monotonic under the composite order".to_string(),
            )),
            Ordering::Greater => {
                let level = &mut self.levels[depth];
                level.valid_end_idx = slot_index as i64;
                level.valid_version = 0;
                level.last_key = key.clone();
                Ok(())
            }
            Ordering::Equal => {
                let valid_version = self.levels[depth].valid_version;
                if version != valid_version && self.versions.is_ancestor(version, valid_version)? {
                    let level = &mut self.levels[depth];
                    level.valid_end_idx = slot_index as i64;
                    level.valid_version = version;
                }
                Ok(())
            }
        }
    }

    /// Appends one entry at `depth`, then completes the node if it is now full.
    fn append_and_maybe_complete(
        &mut self,
        depth: usize,
        key: Key,
        version: VersionId,
        block: DiskBlock,
        is_leaf_ptr: bool,
    ) -> Result<()> {
        if depth >= self.levels.len() {
            return Err(Error::Invariant(
                "merge engine exceeded the configured max btree depth".to_string(),
            ));
        }
        self.ensure_node(depth, depth == 0)?;

        let slot_index = self.levels[depth].next_slot as usize;
        {
            let node_ref = self.levels[depth].node_ref.clone().expect("node allocated");
            let mut node = node_ref.write().expect("lock poisoned");
            self.btree
                .entry_add(&mut node, slot_index, key.clone(), version, is_leaf_ptr, block)?;
        }
        self.levels[depth].next_slot += 1;
        self.record_entry(depth, slot_index, &key, version)?;

        let is_full = {
            let node_ref = self.levels[depth].node_ref.clone().expect("node allocated");
            let node = node_ref.read().expect("lock poisoned");
            self.btree.need_split(&node, 0)
        };
        if is_full {
            self.levels[depth].next_slot = -1;
            self.complete_node(depth)?;
        }
        Ok(())
    }

    /// Completes the node at `depth`: stamps its version, splits off the
    /// trailing (not-yet-safe) entries into `carry`, propagates the pivot
    /// `(last_key, node.version)` to `depth+1` (which may itself cascade),
    /// then drains `carry` back into a freshly allocated node at `depth`.
    fn complete_node(&mut self, depth: usize) -> Result<()> {
        let (node_block, stamped_version, last_key, carry) = {
            let node_ref = self.levels[depth].node_ref.clone().expect("node allocated");
            let mut node = node_ref.write().expect("lock poisoned");

            let valid_end_idx = self.levels[depth].valid_end_idx;
            if valid_end_idx < 0 {
                return Err(Error::Invariant(
                    "node completed with no valid end index".to_string(),
                ));
            }
            let cut = valid_end_idx as usize;
            node.version = self.levels[depth].valid_version;

            let carry: Vec<Entry> = if cut + 1 < node.slots.len() {
                let last_idx = node.slots.len() - 1;
                let carry: Vec<Entry> = (cut + 1..=last_idx)
                    .filter_map(|i| self.btree.entry_get(&node, i))
                    .collect();
                self.btree.entries_drop(&mut node, cut + 1, last_idx);
                carry
            } else {
                Vec::new()
            };

            (
                self.levels[depth].node_block.expect("node allocated"),
                node.version,
                self.levels[depth].last_key.clone(),
                carry,
            )
        };

        self.completed_since_last_check = true;

        self.append_and_maybe_complete(depth + 1, last_key, stamped_version, node_block, depth == 0)?;

        self.alloc_fresh_node(depth, depth == 0)?;
        for entry in carry {
            self.append_and_maybe_complete(depth, entry.key, entry.version, entry.block, entry.is_leaf_ptr)?;
        }
        Ok(())
    }

    /// Inserts one `(key, version, value)` triple from the merged iterator.
    /// Returns whether a node completed as a result (an abandon-check point).
    fn insert_leaf(&mut self, key: Key, version: VersionId, value: DiskBlock) -> Result<bool> {
        self.completed_since_last_check = false;
        self.append_and_maybe_complete(0, key, version, value, true)?;
        self.item_count += 1;
        Ok(self.completed_since_last_check)
    }

    /// End of stream (spec.md §4.7): force-complete every depth with
    /// pending entries, bottom-up. A depth whose node was never propagated
    /// into (the level above is still untouched) needs no completion at
    /// all - it already *is* the root, Case-D stragglers and all, since
    /// nothing routes into a root by its `node.version` field.
    fn finish(&mut self) -> Result<MergeResult> {
        for depth in 0..self.levels.len() {
            while self.levels[depth].next_slot > 0 {
                self.levels[depth].next_slot = -1;

                let next_is_untouched = depth + 1 >= self.levels.len()
                    || self.levels[depth + 1].node_block.is_none();

                if next_is_untouched {
                    break;
                }
                self.complete_node(depth)?;
            }
        }

        if self.item_count == 0 {
            let block = self.free_space.block_get(0, self.btree.node_size())?;
            self.allocated_blocks.push(block);
            let leaf = Node::new(self.btree.magic(), 0, true);
            self.cache.insert(block, self.btree.node_size(), leaf);
            return Ok(MergeResult {
                first_node: block,
                last_node: block,
                node_count: 1,
                item_count: 0,
            });
        }

        let root_depth = self.max_depth_used.expect("at least one node was allocated");
        let first_node = self.levels[root_depth].node_block.expect("root node allocated");
        let last_node = *self
            .allocated_blocks
            .last()
            .expect("at least one node was allocated");
        Ok(MergeResult {
            first_node,
            last_node,
            node_count: self.node_count,
            item_count: self.item_count,
        })
    }
}

/// Runs a merge to completion. Aborts and releases every block this run
/// allocated on any error, or if `abandon` is observed set between two
/// completed nodes (spec.md §5's only admitted cancellation point).
pub fn run(
    mut merged: MergedIterator<'_>,
    btree: &dyn BTreeType,
    cache: &dyn PageCache,
    free_space: &dyn FreeSpaceAllocator,
    versions: &VersionIndex,
    max_btree_depth: usize,
    abandon: &AtomicBool,
) -> Result<MergeOutcome> {
    let mut engine = MergeEngine::new(btree, cache, free_space, versions, max_btree_depth);

    let outcome = (|| -> Result<MergeOutcome> {
        while merged.has_next() {
            let Some((key, version, value)) = merged.next()? else {
                break;
            };
            let completed_node = engine.insert_leaf(key, version, value)?;
            if completed_node && abandon.load(AtomicOrdering::Acquire) {
                return Ok(MergeOutcome::Abandoned);
            }
        }
        Ok(MergeOutcome::Completed(engine.finish()?))
    })();

    match outcome {
        Ok(MergeOutcome::Abandoned) => {
            engine.release_allocated();
            Ok(MergeOutcome::Abandoned)
        }
        Err(e) => {
            engine.release_allocated();
            Err(e)
        }
        ok => ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::simple::ByteKeyType;
    use crate::cache::InMemoryCache;
    use crate::component_tree::{ComponentTree, StaticComponentTree};
    use crate::free_space::InMemoryFreeSpace;
    use crate::merged_iter::MergeInput;

    struct VecInput {
        items: Vec<(Key, VersionId, DiskBlock)>,
        cursor: usize,
    }

    impl MergeInput for VecInput {
        fn has_next(&self) -> bool {
            self.cursor < self.items.len()
        }
        fn next(&mut self) -> Option<(Key, VersionId, DiskBlock)> {
            if !self.has_next() {
                return None;
            }
            let item = self.items[self.cursor].clone();
            self.cursor += 1;
            Some(item)
        }
    }

    fn idx_root_only() -> VersionIndex {
        let idx = VersionIndex::new();
        idx.add(0, None, DiskBlock::new(1, 1), 0).unwrap();
        idx.process().unwrap();
        idx
    }

    fn input_of(items: Vec<(Key, VersionId, DiskBlock)>) -> Vec<Box<dyn MergeInput>> {
        vec![Box::new(VecInput { items, cursor: 0 })]
    }

    #[test]
    fn e6_small_merge_produces_single_node_root() {
        let versions = idx_root_only();
        let bt = ByteKeyType::default();
        let free_space = InMemoryFreeSpace::default();
        let cache = InMemoryCache::default();

        let items = input_of(vec![
            (b"a".to_vec(), 0, DiskBlock::new(2, 1)),
            (b"b".to_vec(), 0, DiskBlock::new(2, 2)),
            (b"c".to_vec(), 0, DiskBlock::new(2, 3)),
        ]);
        let merged = MergedIterator::new(items, &bt, &versions, 10).unwrap();
        let abandon = AtomicBool::new(false);

        let outcome = run(merged, &bt, &cache, &free_space, &versions, 8, &abandon).unwrap();
        let MergeOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };

        assert_eq!(result.item_count, 3);
        assert_eq!(result.node_count, 1);

        let ct = StaticComponentTree::new(1, 1, 1, result.item_count, result.node_count, result.first_node, result.last_node);
        let entries = ct.enumerate(&cache).unwrap();
        assert_eq!(
            entries.iter().map(|e| e.0.clone()).collect::<Vec<_>>(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn merge_with_capacity_one_builds_a_multi_level_tree() {
        let versions = idx_root_only();
        let bt = ByteKeyType::new(1);
        let free_space = InMemoryFreeSpace::default();
        let cache = InMemoryCache::default();

        let items = input_of(vec![
            (b"a".to_vec(), 0, DiskBlock::new(2, 1)),
            (b"b".to_vec(), 0, DiskBlock::new(2, 2)),
            (b"c".to_vec(), 0, DiskBlock::new(2, 3)),
            (b"d".to_vec(), 0, DiskBlock::new(2, 4)),
        ]);
        let merged = MergedIterator::new(items, &bt, &versions, 10).unwrap();
        let abandon = AtomicBool::new(false);

        let outcome = run(merged, &bt, &cache, &free_space, &versions, 8, &abandon).unwrap();
        let MergeOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result.item_count, 4);
        assert!(result.node_count > 1);

        let ct = StaticComponentTree::new(1, 1, 1, result.item_count, result.node_count, result.first_node, result.last_node);
        let entries = ct.enumerate(&cache).unwrap();
        assert_eq!(
            entries.iter().map(|e| e.0.clone()).collect::<Vec<_>>(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        let found = ct.find(&bt, &cache, &versions, b"c", 0).unwrap();
        assert_eq!(found, Some(DiskBlock::new(2, 3)));
    }

    /// E5: a run of same-key entries where each is a strict ancestor of the
    /// one before it (Case C) must stay in one node even when a later
    /// same-key entry is unrelated (Case D, no boundary movement) and pushes
    /// the node over capacity.
    #[test]
    fn e5_ancestor_chain_entries_never_split_across_a_node_boundary() {
        let versions = VersionIndex::new();
        versions.add(0, None, DiskBlock::new(1, 1), 0).unwrap();
        versions.add(1, Some(0), DiskBlock::new(1, 2), 0).unwrap();
        versions.add(2, Some(1), DiskBlock::new(1, 3), 0).unwrap();
        versions.add(3, Some(0), DiskBlock::new(1, 4), 0).unwrap();
        versions.process().unwrap();
        assert!(versions.is_ancestor(1, 2).unwrap());
        assert!(!versions.is_ancestor(3, 1).unwrap());

        // Composite order lists descendants before ancestors for the same
        // key, so `v_desc` (2) precedes its own parent `v_mid` (1); `v_far`
        // (3) is an unrelated sibling of both.
        let bt = ByteKeyType::new(2);
        let free_space = InMemoryFreeSpace::default();
        let cache = InMemoryCache::default();

        let items = input_of(vec![
            (b"k".to_vec(), 2, DiskBlock::new(2, 1)),
            (b"k".to_vec(), 1, DiskBlock::new(2, 2)),
            (b"k".to_vec(), 3, DiskBlock::new(2, 3)),
        ]);
        let merged = MergedIterator::new(items, &bt, &versions, 10).unwrap();
        let abandon = AtomicBool::new(false);

        let outcome = run(merged, &bt, &cache, &free_space, &versions, 8, &abandon).unwrap();
        let MergeOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result.item_count, 3);

        let root_ref = cache.get(result.first_node).expect("root cached");
        let root = root_ref.read().unwrap();
        assert_eq!(root.slots.len(), 2, "one pivot per completed leaf");

        let first_leaf_ref = cache.get(root.slots[0].block).expect("first leaf cached");
        let first_leaf = first_leaf_ref.read().unwrap();
        let first_leaf_versions: Vec<VersionId> =
            first_leaf.slots.iter().map(|e| e.version).collect();
        assert_eq!(
            first_leaf_versions,
            vec![2, 1],
            "the descendant/ancestor pair must land in the same node"
        );

        let second_leaf_ref = cache.get(root.slots[1].block).expect("second leaf cached");
        let second_leaf = second_leaf_ref.read().unwrap();
        assert_eq!(second_leaf.slots.len(), 1);
        assert_eq!(second_leaf.slots[0].version, 3);

        let ct = StaticComponentTree::new(1, 1, 1, result.item_count, result.node_count, result.first_node, result.last_node);
        assert_eq!(ct.find(&bt, &cache, &versions, b"k", 2).unwrap(), Some(DiskBlock::new(2, 1)));
        assert_eq!(ct.find(&bt, &cache, &versions, b"k", 1).unwrap(), Some(DiskBlock::new(2, 2)));
        assert_eq!(ct.find(&bt, &cache, &versions, b"k", 3).unwrap(), Some(DiskBlock::new(2, 3)));
    }

    #[test]
    fn empty_merge_still_produces_a_valid_empty_root() {
        let versions = idx_root_only();
        let bt = ByteKeyType::default();
        let free_space = InMemoryFreeSpace::default();
        let cache = InMemoryCache::default();

        let merged = MergedIterator::new(Vec::new(), &bt, &versions, 10).unwrap();
        let abandon = AtomicBool::new(false);
        let outcome = run(merged, &bt, &cache, &free_space, &versions, 8, &abandon).unwrap();
        let MergeOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result.item_count, 0);
        assert_eq!(result.node_count, 1);
        assert!(result.first_node.is_valid());
    }
}
