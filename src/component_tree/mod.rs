// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Component trees (spec.md §4.3): the sorted `(key, version, value-ref)`
//! containers a doubling array's levels hold. A **dynamic** CT is the
//! single mutable level-0 writer - backed by a lock-free `crossbeam_skiplist`
//! map the way the teacher's `Memtable` backs its own write path - and gives
//! no ordering guarantee on its raw enumerator. A **static** CT is an
//! immutable on-disk B-tree, produced only by the merge engine (§4.7), whose
//! forward enumerator yields the sorted composite order.

use crate::btree::{BTreeType, Key};
use crate::cache::PageCache;
use crate::disk_block::DiskBlock;
use crate::error::{Error, Result};
use crate::free_space::FreeSpaceAllocator;
use crate::version::{VersionId, VersionIndex};
use crossbeam_skiplist::SkipMap;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Point-in-time stats a doubling array / metadata writeback needs per CT
/// (spec.md §3's CT attribute list).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtStats {
    pub seq: u64,
    pub da_id: u64,
    pub level: u32,
    pub dynamic: bool,
    pub item_count: u64,
    pub node_count: u64,
    pub first_node: DiskBlock,
    pub last_node: DiskBlock,
}

/// Shared CT behaviour: the merge engine, the read router, and the modlist
/// iterator all go through this rather than knowing which variant they hold.
pub trait ComponentTree: Send + Sync {
    fn stats(&self) -> CtStats;

    /// Point lookup (spec.md §4.3): the value-ref visible for `key` at
    /// `version`, or `None` if the key is absent in this CT.
    fn find(
        &self,
        btree: &dyn BTreeType,
        cache: &dyn PageCache,
        versions: &VersionIndex,
        key: &[u8],
        version: VersionId,
    ) -> Result<Option<DiskBlock>>;

    /// All `(key, version, value-ref)` triples in this CT's stored order:
    /// composite-sorted for a static CT, arbitrary for a dynamic one.
    fn enumerate(&self, cache: &dyn PageCache) -> Result<Vec<(Key, VersionId, DiskBlock)>>;

    /// Every disk block this CT's own tree structure occupies (not the
    /// value-refs it stores) - used by the doubling array to release a
    /// merge's input CTs once the merge that consumed them completes.
    fn node_blocks(&self, cache: &dyn PageCache) -> Result<Vec<DiskBlock>>;
}

/// The single mutable level-0 CT of a doubling array.
pub struct DynamicComponentTree {
    seq: u64,
    da_id: u64,
    root: DiskBlock,
    entries: SkipMap<(Key, VersionId), DiskBlock>,
    item_count: AtomicU64,
}

impl DynamicComponentTree {
    /// `new_dynamic(da_id, root_version)` (spec.md §4.3): allocates an empty
    /// leaf root via free-space so the CT always has a valid `first_node`,
    /// even though live entries are served from the in-memory skiplist.
    pub fn new_dynamic(
        seq: u64,
        da_id: u64,
        btree: &dyn BTreeType,
        free_space: &dyn FreeSpaceAllocator,
        cache: &dyn PageCache,
    ) -> Result<Self> {
        let root = free_space.block_get(0, btree.node_size())?;
        let empty_leaf = crate::btree::Node::new(btree.magic(), 0, true);
        cache.insert(root, btree.node_size(), empty_leaf);

        Ok(Self {
            seq,
            da_id,
            root,
            entries: SkipMap::new(),
            item_count: AtomicU64::new(0),
        })
    }

    /// Inserts or overwrites the entry for `(key, version)`.
    pub fn insert(&self, key: Key, version: VersionId, value: DiskBlock) {
        let is_new = self.entries.get(&(key.clone(), version)).is_none();
        self.entries.insert((key, version), value);
        if is_new {
            self.item_count.fetch_add(1, AtomicOrdering::AcqRel);
        }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.item_count.load(AtomicOrdering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ComponentTree for DynamicComponentTree {
    fn stats(&self) -> CtStats {
        CtStats {
            seq: self.seq,
            da_id: self.da_id,
            level: 0,
            dynamic: true,
            item_count: self.item_count.load(AtomicOrdering::Acquire),
            node_count: 1,
            first_node: self.root,
            last_node: self.root,
        }
    }

    fn find(
        &self,
        _btree: &dyn BTreeType,
        _cache: &dyn PageCache,
        versions: &VersionIndex,
        key: &[u8],
        version: VersionId,
    ) -> Result<Option<DiskBlock>> {
        let mut best: Option<(u32, DiskBlock)> = None;
        for entry in self.entries.range((key.to_vec(), VersionId::MIN)..=(key.to_vec(), VersionId::MAX)) {
            let (entry_key, entry_version) = entry.key();
            if entry_key.as_slice() != key {
                continue;
            }
            if !versions.is_ancestor(*entry_version, version)? {
                continue;
            }
            let order = versions.o_order(*entry_version)?;
            if best.is_none_or(|(best_order, _)| order > best_order) {
                best = Some((order, *entry.value()));
            }
        }
        Ok(best.map(|(_, block)| block))
    }

    fn enumerate(&self, _cache: &dyn PageCache) -> Result<Vec<(Key, VersionId, DiskBlock)>> {
        Ok(self
            .entries
            .iter()
            .map(|entry| {
                let (key, version) = entry.key().clone();
                (key, version, *entry.value())
            })
            .collect())
    }

    fn node_blocks(&self, _cache: &dyn PageCache) -> Result<Vec<DiskBlock>> {
        Ok(vec![self.root])
    }
}

/// An immutable, on-disk B-tree CT, built only by the merge engine.
pub struct StaticComponentTree {
    seq: u64,
    da_id: u64,
    level: u32,
    item_count: u64,
    node_count: u64,
    first_node: DiskBlock,
    last_node: DiskBlock,
}

impl StaticComponentTree {
    #[must_use]
    pub fn new(
        seq: u64,
        da_id: u64,
        level: u32,
        item_count: u64,
        node_count: u64,
        first_node: DiskBlock,
        last_node: DiskBlock,
    ) -> Self {
        Self {
            seq,
            da_id,
            level,
            item_count,
            node_count,
            first_node,
            last_node,
        }
    }

    fn load(cache: &dyn PageCache, block: DiskBlock) -> Result<crate::btree::Node> {
        let Some(node_ref) = cache.get(block) else {
            return Err(Error::Storage(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "CT node block missing from cache",
            )));
        };
        Ok(node_ref.read().expect("lock poisoned").clone())
    }
}

impl ComponentTree for StaticComponentTree {
    fn stats(&self) -> CtStats {
        CtStats {
            seq: self.seq,
            da_id: self.da_id,
            level: self.level,
            dynamic: false,
            item_count: self.item_count,
            node_count: self.node_count,
            first_node: self.first_node,
            last_node: self.last_node,
        }
    }

    fn find(
        &self,
        btree: &dyn BTreeType,
        cache: &dyn PageCache,
        versions: &VersionIndex,
        key: &[u8],
        version: VersionId,
    ) -> Result<Option<DiskBlock>> {
        let mut block = self.first_node;
        loop {
            let node = Self::load(cache, block)?;

            if node.is_leaf {
                let mut best: Option<(u32, DiskBlock)> = None;
                for slot in &node.slots {
                    if btree.key_compare(&slot.key, key) != Ordering::Equal {
                        continue;
                    }
                    if !versions.is_ancestor(slot.version, version)? {
                        continue;
                    }
                    let order = versions.o_order(slot.version)?;
                    if best.is_none_or(|(best_order, _)| order > best_order) {
                        best = Some((order, slot.block));
                    }
                }
                return Ok(best.map(|(_, block)| block));
            }

            let next = node.slots.iter().find(|slot| {
                btree.key_compare(&slot.key, key) != Ordering::Less
                    && versions
                        .is_ancestor(slot.version, version)
                        .unwrap_or(false)
            });

            match next {
                Some(slot) => block = slot.block,
                None => return Ok(None),
            }
        }
    }

    fn enumerate(&self, cache: &dyn PageCache) -> Result<Vec<(Key, VersionId, DiskBlock)>> {
        fn walk(
            cache: &dyn PageCache,
            block: DiskBlock,
            out: &mut Vec<(Key, VersionId, DiskBlock)>,
        ) -> Result<()> {
            let node = StaticComponentTree::load(cache, block)?;
            if node.is_leaf {
                out.extend(
                    node.slots
                        .iter()
                        .map(|slot| (slot.key.clone(), slot.version, slot.block)),
                );
            } else {
                for slot in &node.slots {
                    walk(cache, slot.block, out)?;
                }
            }
            Ok(())
        }

        let mut out = Vec::new();
        walk(cache, self.first_node, &mut out)?;
        Ok(out)
    }

    fn node_blocks(&self, cache: &dyn PageCache) -> Result<Vec<DiskBlock>> {
        fn walk(cache: &dyn PageCache, block: DiskBlock, out: &mut Vec<DiskBlock>) -> Result<()> {
            let node = StaticComponentTree::load(cache, block)?;
            out.push(block);
            if !node.is_leaf {
                for slot in &node.slots {
                    walk(cache, slot.block, out)?;
                }
            }
            Ok(())
        }

        let mut out = Vec::new();
        walk(cache, self.first_node, &mut out)?;
        Ok(out)
    }
}
