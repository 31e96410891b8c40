// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Modlist Iterator (spec.md §4.4): sort-on-read over a dynamic CT. Drains
//! the CT's raw (unordered) enumerator into in-memory node buffers via
//! `entry_add`/`need_split`, indexes every slot, then heapifies and
//! heapsorts that index under the composite order - the source's
//! `castle_ct_modlist_iter_init` does the same two-pass load-then-heapsort
//! rather than an incremental sorted insert, because the node buffer's size
//! is only known once the drain completes.

use crate::btree::{composite_compare, BTreeType, Key, Node};
use crate::component_tree::ComponentTree;
use crate::cache::PageCache;
use crate::error::Result;
use crate::version::{VersionId, VersionIndex};

struct Slot {
    node: usize,
    index: usize,
}

/// A composite-sorted, in-memory snapshot of one dynamic CT.
pub struct ModlistIterator {
    nodes: Vec<Node>,
    order: Vec<Slot>,
    cursor: usize,
}

impl ModlistIterator {
    /// Builds the sorted snapshot. Budget is bounded by the CT's
    /// `item_count` (spec.md §4.4); any allocation failure here aborts
    /// init with `OutOfMemory` and leaves no partial iterator behind.
    pub fn new(
        ct: &dyn ComponentTree,
        btree: &dyn BTreeType,
        cache: &dyn PageCache,
        versions: &VersionIndex,
    ) -> Result<Self> {
        let raw = ct.enumerate(cache)?;

        let mut nodes = vec![btree_leaf(btree)];
        let mut order = Vec::with_capacity(raw.len());

        for (key, version, value) in raw {
            if btree.need_split(nodes.last().expect("at least one node"), 1) {
                nodes.push(btree_leaf(btree));
            }
            let node_idx = nodes.len() - 1;
            let node = nodes.last_mut().expect("at least one node");
            let slot_idx = node.slots.len();
            btree.entry_add(node, slot_idx, key, version, true, value)?;
            order.push(Slot {
                node: node_idx,
                index: slot_idx,
            });
        }

        let mut iter = Self {
            nodes,
            order,
            cursor: 0,
        };
        iter.heap_sort(btree, versions)?;
        Ok(iter)
    }

    fn entry_at(&self, slot: &Slot) -> (&Key, VersionId) {
        let entry = &self.nodes[slot.node].slots[slot.index];
        (&entry.key, entry.version)
    }

    fn cmp(&self, btree: &dyn BTreeType, versions: &VersionIndex, a: usize, b: usize) -> Result<std::cmp::Ordering> {
        let (k1, v1) = self.entry_at(&self.order[a]);
        let (k2, v2) = self.entry_at(&self.order[b]);
        composite_compare(btree, k1, v1, k2, v2, |v| versions.o_order(v))
    }

    fn sift_down(
        &mut self,
        btree: &dyn BTreeType,
        versions: &VersionIndex,
        mut root: usize,
        end: usize,
    ) -> Result<()> {
        loop {
            let left = 2 * root + 1;
            if left >= end {
                return Ok(());
            }
            let right = left + 1;
            let mut largest = left;
            if right < end && self.cmp(btree, versions, right, largest)? == std::cmp::Ordering::Greater {
                largest = right;
            }
            if self.cmp(btree, versions, largest, root)? != std::cmp::Ordering::Greater {
                return Ok(());
            }
            self.order.swap(root, largest);
            root = largest;
        }
    }

    /// Heapify as a max-heap under the composite order, then repeatedly move
    /// the max to the tail and shrink, yielding ascending composite order.
    fn heap_sort(&mut self, btree: &dyn BTreeType, versions: &VersionIndex) -> Result<()> {
        let len = self.order.len();
        if len < 2 {
            return Ok(());
        }
        for root in (0..len / 2).rev() {
            self.sift_down(btree, versions, root, len)?;
        }
        for end in (1..len).rev() {
            self.order.swap(0, end);
            self.sift_down(btree, versions, 0, end)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.cursor < self.order.len()
    }

    pub fn next(&mut self) -> Option<(Key, VersionId, crate::disk_block::DiskBlock)> {
        if !self.has_next() {
            return None;
        }
        let slot = &self.order[self.cursor];
        let entry = &self.nodes[slot.node].slots[slot.index];
        let out = (entry.key.clone(), entry.version, entry.block);
        self.cursor += 1;
        Some(out)
    }
}

fn btree_leaf(btree: &dyn BTreeType) -> Node {
    Node::new(btree.magic(), 0, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::simple::ByteKeyType;
    use crate::cache::InMemoryCache;
    use crate::component_tree::DynamicComponentTree;
    use crate::disk_block::DiskBlock;
    use crate::free_space::InMemoryFreeSpace;

    fn idx_with_chain() -> VersionIndex {
        let idx = VersionIndex::new();
        idx.add(0, None, DiskBlock::new(1, 100), 0).unwrap();
        idx.add(1, Some(0), DiskBlock::new(1, 101), 0).unwrap();
        idx.add(2, Some(0), DiskBlock::new(1, 102), 0).unwrap();
        idx.process().unwrap();
        idx
    }

    /// `1` is the parent of both `2` and `3`, so it is an ancestor of each.
    fn idx_with_shared_ancestor() -> VersionIndex {
        let idx = VersionIndex::new();
        idx.add(0, None, DiskBlock::new(1, 100), 0).unwrap();
        idx.add(1, Some(0), DiskBlock::new(1, 101), 0).unwrap();
        idx.add(2, Some(1), DiskBlock::new(1, 102), 0).unwrap();
        idx.add(3, Some(1), DiskBlock::new(1, 103), 0).unwrap();
        idx.process().unwrap();
        idx
    }

    #[test]
    fn e2_modlist_emits_composite_sorted_stream() {
        let versions = idx_with_shared_ancestor();
        assert!(versions.is_ancestor(1, 2).unwrap());
        assert!(versions.is_ancestor(1, 3).unwrap());
        let bt = ByteKeyType::default();
        let free_space = InMemoryFreeSpace::default();
        let cache = InMemoryCache::default();

        let ct = DynamicComponentTree::new_dynamic(1, 1, &bt, &free_space, &cache).unwrap();
        // Inserted in the spec example's literal order, out of composite order.
        ct.insert(b"7".to_vec(), 3, DiskBlock::new(2, 1));
        ct.insert(b"5".to_vec(), 1, DiskBlock::new(2, 2));
        ct.insert(b"7".to_vec(), 1, DiskBlock::new(2, 3));
        ct.insert(b"5".to_vec(), 2, DiskBlock::new(2, 4));

        let mut iter = ModlistIterator::new(&ct, &bt, &cache, &versions).unwrap();

        let mut out = Vec::new();
        while iter.has_next() {
            out.push(iter.next().unwrap());
        }

        assert_eq!(
            out.iter().map(|(k, v, _)| (k.clone(), *v)).collect::<Vec<_>>(),
            vec![
                (b"5".to_vec(), 2),
                (b"5".to_vec(), 1),
                (b"7".to_vec(), 3),
                (b"7".to_vec(), 1),
            ],
            "within a key, a descendant version sorts before its ancestor"
        );
        assert!(!iter.has_next());
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn modlist_over_empty_ct_has_no_next() {
        let versions = idx_with_chain();
        let bt = ByteKeyType::default();
        let free_space = InMemoryFreeSpace::default();
        let cache = InMemoryCache::default();
        let ct = DynamicComponentTree::new_dynamic(1, 1, &bt, &free_space, &cache).unwrap();

        let iter = ModlistIterator::new(&ct, &bt, &cache, &versions).unwrap();
        assert!(!iter.has_next());
    }

    #[test]
    fn modlist_splits_across_nodes_past_capacity() {
        let versions = idx_with_chain();
        let bt = ByteKeyType::new(2);
        let free_space = InMemoryFreeSpace::default();
        let cache = InMemoryCache::default();
        let ct = DynamicComponentTree::new_dynamic(1, 1, &bt, &free_space, &cache).unwrap();

        for i in 0..5u8 {
            ct.insert(vec![i], 0, DiskBlock::new(2, i as u32));
        }

        let mut iter = ModlistIterator::new(&ct, &bt, &cache, &versions).unwrap();
        let mut out = Vec::new();
        while let Some(e) = iter.next() {
            out.push(e.0);
        }
        assert_eq!(out, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    }
}
