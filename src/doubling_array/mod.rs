// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The doubling array (spec.md §4.6): per-level CT lists, seal-on-threshold,
//! oldest-two-CTs merge scheduling, and the newest-first Read Router. Grounded
//! on `castle_da.c`'s `struct castle_double_array` (a fixed array of per-level
//! CT lists) and on the teacher's `Level` (`src/level_manifest/level.rs`) for
//! the "small `Vec` behind a lock, re-sorted on mutation" structural pattern -
//! this crate sorts by CT `seq` instead of the teacher's key range / seqno.

use crate::btree::{BTreeType, Key};
use crate::cache::PageCache;
use crate::component_tree::{ComponentTree, CtStats, DynamicComponentTree, StaticComponentTree};
use crate::config::Config;
use crate::disk_block::DiskBlock;
use crate::error::{Error, Result};
use crate::free_space::FreeSpaceAllocator;
use crate::merge::{self, MergeOutcome};
use crate::merged_iter::{MergeInput, MergedIterator};
use crate::modlist_iter::ModlistIterator;
use crate::version::{VersionId, VersionIndex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

/// Upper bound on how many levels a doubling array may grow to. Each level
/// holds roughly double the items of the one below, so this comfortably
/// covers any workload a single process handles in-core (spec.md §4.6 leaves
/// the exact bound to the implementation).
pub const MAX_LEVEL: usize = 16;

/// A pre-sorted composite-order iterator over a static CT's already-sorted
/// `enumerate()` result. `StaticComponentTree::enumerate` walks leaves
/// left-to-right, which *is* composite order (spec.md §4.3), so no
/// additional sort is needed here the way the modlist iterator needs one for
/// a dynamic CT's unordered entries.
struct StaticCtIterator {
    items: Vec<(Key, VersionId, DiskBlock)>,
    cursor: usize,
}

impl StaticCtIterator {
    fn new(ct: &dyn ComponentTree, cache: &dyn PageCache) -> Result<Self> {
        Ok(Self {
            items: ct.enumerate(cache)?,
            cursor: 0,
        })
    }
}

impl MergeInput for StaticCtIterator {
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

fn merge_input_for(
    ct: &Arc<dyn ComponentTree>,
    btree: &dyn BTreeType,
    cache: &dyn PageCache,
    versions: &VersionIndex,
) -> Result<Box<dyn MergeInput>> {
    if ct.stats().dynamic {
        Ok(Box::new(ModlistIterator::new(ct.as_ref(), btree, cache, versions)?))
    } else {
        Ok(Box::new(StaticCtIterator::new(ct.as_ref(), cache)?))
    }
}

/// Result of asking the doubling array to service its scheduler for one
/// level: whether a merge ran, and if so whether it completed or was
/// abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStepOutcome {
    NothingToDo,
    Completed,
    Abandoned,
}

/// A leveled organization of component trees over one version forest
/// (spec.md §4.6). Level 0 always holds exactly one dynamic CT, the current
/// write target; every other level holds zero or more sealed/static CTs
/// awaiting or resulting from a merge.
pub struct DoublingArray {
    da_id: u64,
    btree: Arc<dyn BTreeType>,
    cache: Arc<dyn PageCache>,
    free_space: Arc<dyn FreeSpaceAllocator>,
    versions: Arc<VersionIndex>,
    config: Config,
    next_seq: AtomicU64,
    level0: RwLock<Arc<DynamicComponentTree>>,
    /// `levels[i]` holds level `i + 1`'s CTs (level 0 is tracked separately
    /// in `level0`, since it is never more than a single entry).
    levels: Vec<RwLock<Vec<Arc<dyn ComponentTree>>>>,
    in_merge: Vec<AtomicBool>,
    cancel_requested: Vec<Arc<AtomicBool>>,
}

impl DoublingArray {
    /// Creates a doubling array with a fresh, empty level-0 dynamic CT.
    pub fn new(
        da_id: u64,
        btree: Arc<dyn BTreeType>,
        cache: Arc<dyn PageCache>,
        free_space: Arc<dyn FreeSpaceAllocator>,
        versions: Arc<VersionIndex>,
        config: Config,
    ) -> Result<Self> {
        let level0 = Arc::new(DynamicComponentTree::new_dynamic(
            1,
            da_id,
            btree.as_ref(),
            free_space.as_ref(),
            cache.as_ref(),
        )?);

        Ok(Self {
            da_id,
            btree,
            cache,
            free_space,
            versions,
            config,
            next_seq: AtomicU64::new(2),
            level0: RwLock::new(level0),
            levels: (0..MAX_LEVEL - 1).map(|_| RwLock::new(Vec::new())).collect(),
            in_merge: (0..MAX_LEVEL).map(|_| AtomicBool::new(false)).collect(),
            cancel_requested: (0..MAX_LEVEL).map(|_| Arc::new(AtomicBool::new(false))).collect(),
        })
    }

    fn fresh_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, AtomicOrdering::AcqRel)
    }

    /// Inserts one `(key, version, value)` triple into the live level-0 CT,
    /// then seals it if it has grown past `Config::sealing_threshold`.
    pub fn insert(&self, key: Key, version: VersionId, value: DiskBlock) -> Result<()> {
        {
            let guard = self.level0.read().expect("lock poisoned");
            guard.insert(key, version, value);
        }
        self.seal_if_needed()?;
        Ok(())
    }

    fn seal_if_needed(&self) -> Result<()> {
        let needs_seal = {
            let guard = self.level0.read().expect("lock poisoned");
            guard.len() > self.config.sealing_threshold
        };
        if !needs_seal {
            return Ok(());
        }

        let fresh = Arc::new(DynamicComponentTree::new_dynamic(
            self.fresh_seq(),
            self.da_id,
            self.btree.as_ref(),
            self.free_space.as_ref(),
            self.cache.as_ref(),
        )?);

        let sealed: Arc<dyn ComponentTree> = {
            let mut guard = self.level0.write().expect("lock poisoned");
            std::mem::replace(&mut *guard, fresh)
        };

        self.levels[0].write().expect("lock poisoned").push(sealed);
        Ok(())
    }

    /// Read router (spec.md §4.6): level 0 forward, newest-first within a
    /// level, first non-absent result wins.
    pub fn find(&self, key: &[u8], version: VersionId) -> Result<Option<DiskBlock>> {
        {
            let guard = self.level0.read().expect("lock poisoned");
            if let Some(block) = guard.find(self.btree.as_ref(), self.cache.as_ref(), &self.versions, key, version)? {
                return Ok(Some(block));
            }
        }

        for level in &self.levels {
            let guard = level.read().expect("lock poisoned");
            let mut cts: Vec<&Arc<dyn ComponentTree>> = guard.iter().collect();
            cts.sort_by(|a, b| b.stats().seq.cmp(&a.stats().seq));
            for ct in cts {
                if let Some(block) = ct.find(self.btree.as_ref(), self.cache.as_ref(), &self.versions, key, version)? {
                    return Ok(Some(block));
                }
            }
        }

        Ok(None)
    }

    /// Requests that an in-flight merge at `level` abandon between its next
    /// two node completions (spec.md §5).
    pub fn cancel_merge(&self, level: usize) {
        if let Some(flag) = self.cancel_requested.get(level) {
            flag.store(true, AtomicOrdering::Release);
        }
    }

    /// Services the merge scheduler for `level` (1-indexed user-visible
    /// level; levels[0] here holds *level 1*'s CTs): if it holds two or more
    /// CTs and no merge is already running there, merges the two oldest
    /// (smallest `seq`) into one new CT installed one level up.
    pub fn step_merge(&self, level: usize) -> Result<MergeStepOutcome> {
        if level == 0 || level > self.levels.len() {
            return Ok(MergeStepOutcome::NothingToDo);
        }
        let idx = level - 1;

        if self.in_merge[level].swap(true, AtomicOrdering::AcqRel) {
            return Ok(MergeStepOutcome::NothingToDo);
        }
        let _release_guard = InMergeGuard {
            flag: &self.in_merge[level],
        };

        let (oldest, next_oldest) = {
            let guard = self.levels[idx].read().expect("lock poisoned");
            if guard.len() < 2 {
                return Ok(MergeStepOutcome::NothingToDo);
            }
            let mut sorted: Vec<Arc<dyn ComponentTree>> = guard.clone();
            sorted.sort_by_key(|ct| ct.stats().seq);
            (sorted[0].clone(), sorted[1].clone())
        };

        self.cancel_requested[level].store(false, AtomicOrdering::Release);

        let inputs = vec![
            merge_input_for(&oldest, self.btree.as_ref(), self.cache.as_ref(), &self.versions)?,
            merge_input_for(&next_oldest, self.btree.as_ref(), self.cache.as_ref(), &self.versions)?,
        ];
        let merged = MergedIterator::new(
            inputs,
            self.btree.as_ref(),
            &self.versions,
            self.config.max_merge_inputs,
        )?;

        let outcome = merge::run(
            merged,
            self.btree.as_ref(),
            self.cache.as_ref(),
            self.free_space.as_ref(),
            &self.versions,
            self.config.max_btree_depth,
            &self.cancel_requested[level],
        )?;

        match outcome {
            MergeOutcome::Abandoned => Ok(MergeStepOutcome::Abandoned),
            MergeOutcome::Completed(result) => {
                let new_ct: Arc<dyn ComponentTree> = Arc::new(StaticComponentTree::new(
                    self.fresh_seq(),
                    self.da_id,
                    (level + 1) as u32,
                    result.item_count,
                    result.node_count,
                    result.first_node,
                    result.last_node,
                ));

                for ct in [&oldest, &next_oldest] {
                    for block in ct.node_blocks(self.cache.as_ref())? {
                        self.free_space.block_put(block);
                    }
                }

                {
                    let mut guard = self.levels[idx].write().expect("lock poisoned");
                    guard.retain(|ct| !Arc::ptr_eq(ct, &oldest) && !Arc::ptr_eq(ct, &next_oldest));
                }

                // `levels[i]` holds level `i + 1`'s CTs, so level `level + 1`
                // lands at index `level`.
                let Some(target) = self.levels.get(level) else {
                    return Err(Error::Invariant(
                        "doubling array exceeded its configured maximum level".to_string(),
                    ));
                };
                target.write().expect("lock poisoned").push(new_ct);

                Ok(MergeStepOutcome::Completed)
            }
        }
    }

    /// Snapshot of every CT's stats across every level, level 0 first.
    pub fn all_stats(&self) -> Vec<CtStats> {
        let mut out = vec![self.level0.read().expect("lock poisoned").stats()];
        for level in &self.levels {
            out.extend(level.read().expect("lock poisoned").iter().map(|ct| ct.stats()));
        }
        out
    }
}

struct InMergeGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InMergeGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, AtomicOrdering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::simple::ByteKeyType;
    use crate::cache::InMemoryCache;
    use crate::free_space::InMemoryFreeSpace;

    fn idx_root_only() -> Arc<VersionIndex> {
        let idx = VersionIndex::new();
        idx.add(0, None, DiskBlock::new(1, 1), 0).unwrap();
        idx.process().unwrap();
        Arc::new(idx)
    }

    fn da(sealing_threshold: u64) -> DoublingArray {
        let btree: Arc<dyn BTreeType> = Arc::new(ByteKeyType::default());
        let cache: Arc<dyn PageCache> = Arc::new(InMemoryCache::default());
        let free_space: Arc<dyn FreeSpaceAllocator> = Arc::new(InMemoryFreeSpace::default());
        let versions = idx_root_only();
        let config = Config::new().sealing_threshold(sealing_threshold);
        DoublingArray::new(1, btree, cache, free_space, versions, config).unwrap()
    }

    /// E4: a key overwritten after a seal must resolve to the fresher,
    /// level-0 value, not the stale one left behind in the sealed CT.
    #[test]
    fn e4_router_prefers_newer_ct_on_conflicting_keys() {
        let da = da(2);
        da.insert(b"k".to_vec(), 0, DiskBlock::new(2, 1)).unwrap();
        da.insert(b"other".to_vec(), 0, DiskBlock::new(2, 2)).unwrap();
        // Sealing threshold is 2: this third insert seals the CT holding
        // {k, other} and starts a fresh, empty level-0 CT.
        da.insert(b"z".to_vec(), 0, DiskBlock::new(2, 3)).unwrap();
        assert_eq!(da.levels[0].read().unwrap().len(), 1);

        da.insert(b"k".to_vec(), 0, DiskBlock::new(2, 99)).unwrap();
        assert_eq!(da.find(b"k", 0).unwrap(), Some(DiskBlock::new(2, 99)));
    }

    /// E4 (spec.md §8, literal scenario): three CTs hold the same key on
    /// different, ancestor-related versions. The router must pick the
    /// newest CT whose version is an ancestor of the query, not just the
    /// newest CT outright.
    #[test]
    fn e4_router_resolves_conflicting_keys_by_ancestry_not_just_recency() {
        // Chain 0 -> 1 -> 2 -> 4; `5` and `9` are unrelated siblings of `1`.
        let versions = VersionIndex::new();
        versions.add(0, None, DiskBlock::new(1, 1), 0).unwrap();
        versions.add(1, Some(0), DiskBlock::new(1, 2), 0).unwrap();
        versions.add(2, Some(1), DiskBlock::new(1, 3), 0).unwrap();
        versions.add(4, Some(2), DiskBlock::new(1, 4), 0).unwrap();
        versions.add(5, Some(0), DiskBlock::new(1, 5), 0).unwrap();
        versions.add(9, Some(0), DiskBlock::new(1, 6), 0).unwrap();
        versions.process().unwrap();
        assert!(versions.is_ancestor(2, 4).unwrap());
        assert!(!versions.is_ancestor(5, 4).unwrap());
        assert!(!versions.is_ancestor(1, 9).unwrap());

        let btree: Arc<dyn BTreeType> = Arc::new(ByteKeyType::default());
        let cache: Arc<dyn PageCache> = Arc::new(InMemoryCache::default());
        let free_space: Arc<dyn FreeSpaceAllocator> = Arc::new(InMemoryFreeSpace::default());
        let config = Config::new().sealing_threshold(0);
        let da = DoublingArray::new(1, btree, cache, free_space, Arc::new(versions), config).unwrap();

        // Each insert seals immediately (threshold 0), so these land as
        // three separate level-1 CTs: CT_C (v=1, oldest), CT_B (v=2), CT_A
        // (v=5, newest).
        da.insert(b"k".to_vec(), 1, DiskBlock::new(2, 1)).unwrap();
        da.insert(b"k".to_vec(), 2, DiskBlock::new(2, 2)).unwrap();
        da.insert(b"k".to_vec(), 5, DiskBlock::new(2, 5)).unwrap();
        assert_eq!(da.levels[0].read().unwrap().len(), 3);

        assert_eq!(da.find(b"k", 5).unwrap(), Some(DiskBlock::new(2, 5)));
        assert_eq!(da.find(b"k", 4).unwrap(), Some(DiskBlock::new(2, 2)));
        assert_eq!(da.find(b"k", 9).unwrap(), None);
    }

    #[test]
    fn sealing_moves_the_full_ct_to_level_one_and_resets_level_zero() {
        let da = da(2);
        da.insert(b"a".to_vec(), 0, DiskBlock::new(2, 1)).unwrap();
        da.insert(b"b".to_vec(), 0, DiskBlock::new(2, 2)).unwrap();
        da.insert(b"c".to_vec(), 0, DiskBlock::new(2, 3)).unwrap();

        // The third insert pushed level 0 over the threshold, so it was
        // just sealed away: the active CT is fresh and empty again.
        assert_eq!(da.level0.read().unwrap().len(), 0);
        assert_eq!(da.levels[0].read().unwrap().len(), 1);
        assert_eq!(da.find(b"a", 0).unwrap(), Some(DiskBlock::new(2, 1)));
        assert_eq!(da.find(b"c", 0).unwrap(), Some(DiskBlock::new(2, 3)));
    }

    #[test]
    fn step_merge_combines_two_level_one_cts_into_level_two() {
        let da = da(1);
        // Each pair of inserts seals once the threshold (1) is exceeded,
        // producing two separate level-1 CTs: {a, b} and {c, d}.
        da.insert(b"a".to_vec(), 0, DiskBlock::new(2, 1)).unwrap();
        da.insert(b"b".to_vec(), 0, DiskBlock::new(2, 2)).unwrap();
        da.insert(b"c".to_vec(), 0, DiskBlock::new(2, 3)).unwrap();
        da.insert(b"d".to_vec(), 0, DiskBlock::new(2, 4)).unwrap();
        assert_eq!(da.levels[0].read().unwrap().len(), 2);

        let outcome = da.step_merge(1).unwrap();
        assert_eq!(outcome, MergeStepOutcome::Completed);
        assert_eq!(da.levels[0].read().unwrap().len(), 0);
        assert_eq!(da.levels[1].read().unwrap().len(), 1);

        assert_eq!(da.find(b"a", 0).unwrap(), Some(DiskBlock::new(2, 1)));
        assert_eq!(da.find(b"d", 0).unwrap(), Some(DiskBlock::new(2, 4)));
    }

    #[test]
    fn step_merge_on_level_with_one_ct_is_a_no_op() {
        let da = da(2);
        da.insert(b"a".to_vec(), 0, DiskBlock::new(2, 1)).unwrap();
        da.insert(b"b".to_vec(), 0, DiskBlock::new(2, 2)).unwrap();
        da.insert(b"c".to_vec(), 0, DiskBlock::new(2, 3)).unwrap();
        assert_eq!(da.levels[0].read().unwrap().len(), 1);

        assert_eq!(da.step_merge(1).unwrap(), MergeStepOutcome::NothingToDo);
    }
}
