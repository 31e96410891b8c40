// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The version forest and its ancestry index.
//!
//! A [`VersionIndex`] is a process-wide singleton (spec.md §3): every
//! reachable version lives in one arena keyed by its `u32` id, linked
//! together with intrusive-style `first_child`/`next_sibling` indices rather
//! than pointers, per the design note in spec.md §9.

use crate::disk_block::DiskBlock;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

pub type VersionId = u32;

const INVAL_ORDER: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct VersionNode {
    parent_id: Option<VersionId>,
    first_child: Option<VersionId>,
    next_sibling: Option<VersionId>,
    o_order: u32,
    r_order: u32,
    root_block: DiskBlock,
    size: u64,
    initialized: bool,
    /// `seq` of the component tree that last called `root_update`.
    last_updated_by_seq: u64,
}

impl VersionNode {
    fn root(root_block: DiskBlock, size: u64) -> Self {
        Self {
            parent_id: None,
            first_child: None,
            next_sibling: None,
            o_order: INVAL_ORDER,
            r_order: INVAL_ORDER,
            root_block,
            size,
            initialized: true,
            last_updated_by_seq: 0,
        }
    }

    fn pending(parent_id: VersionId, root_block: DiskBlock, size: u64) -> Self {
        Self {
            parent_id: Some(parent_id),
            first_child: None,
            next_sibling: None,
            o_order: INVAL_ORDER,
            r_order: INVAL_ORDER,
            root_block,
            size,
            initialized: false,
            last_updated_by_seq: 0,
        }
    }
}

struct Inner {
    nodes: HashMap<VersionId, VersionNode>,
    pending: VecDeque<VersionId>,
}

/// Authoritative store of the version forest.
pub struct VersionIndex {
    inner: Mutex<Inner>,
    version_locks: Mutex<HashMap<VersionId, Arc<RwLock<()>>>>,
}

impl Default for VersionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionIndex {
    /// Creates an empty index. The root version (id 0) is not yet present -
    /// call [`VersionIndex::add`] for it too, as the source does.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                pending: VecDeque::new(),
            }),
            version_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.inner.lock().expect("lock poisoned")
    }

    fn version_lock(&self, version: VersionId) -> Arc<RwLock<()>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut locks = self.version_locks.lock().expect("lock poisoned");
        locks
            .entry(version)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Inserts a deferred-initialization record for `version`.
    ///
    /// `version == 0` is the root and is inserted eagerly as initialized;
    /// every other version is parented under `parent` and initialized later
    /// by [`VersionIndex::process`].
    pub fn add(
        &self,
        version: VersionId,
        parent: Option<VersionId>,
        root_block: DiskBlock,
        size: u64,
    ) -> Result<()> {
        let mut inner = self.lock();

        if inner.nodes.contains_key(&version) {
            return Err(Error::Invariant(format!(
                "version {version} added twice"
            )));
        }

        if version == 0 {
            log::debug!("adding root version 0");
            inner.nodes.insert(version, VersionNode::root(root_block, size));
        } else {
            let parent = parent.ok_or_else(|| {
                Error::Invariant(format!("non-root version {version} has no parent"))
            })?;
            log::debug!("adding version {version} with parent {parent}");
            inner
                .nodes
                .insert(version, VersionNode::pending(parent, root_block, size));
            inner.pending.push_back(version);
        }

        Ok(())
    }

    /// Turns the flat set of added versions into a forest with DFS
    /// numbering. After a successful call every version is initialized and
    /// ancestry can be tested in O(1).
    pub fn process(&self) -> Result<()> {
        let mut inner = self.lock();

        while let Some(first) = inner.pending.pop_front() {
            let mut v = first;
            let mut chain = HashSet::new();

            loop {
                if !chain.insert(v) {
                    return Err(Error::Invariant(
                        "cycle detected while parenting the version forest".into(),
                    ));
                }

                let initialized = inner
                    .nodes
                    .get(&v)
                    .ok_or_else(|| Error::Invariant(format!("unknown version {v}")))?
                    .initialized;
                if initialized {
                    // Already linked in by an earlier walk-up; nothing to do.
                    break;
                }

                let parent_id = inner
                    .nodes
                    .get(&v)
                    .and_then(|n| n.parent_id)
                    .ok_or_else(|| Error::Invariant(format!("version {v} has no parent_id")))?;

                let parent_initialized = inner
                    .nodes
                    .get(&parent_id)
                    .ok_or_else(|| Error::Invariant(format!("unknown parent {parent_id}")))?
                    .initialized;

                if !parent_initialized {
                    // Keep going with the parent; re-queue v at the head so
                    // it's retried right after its parent lands.
                    inner.pending.push_front(v);
                    v = parent_id;
                    continue;
                }

                let parent_first_child = inner
                    .nodes
                    .get(&parent_id)
                    .and_then(|p| p.first_child);

                if let Some(node) = inner.nodes.get_mut(&v) {
                    node.next_sibling = parent_first_child;
                    node.initialized = true;
                }
                if let Some(parent) = inner.nodes.get_mut(&parent_id) {
                    parent.first_child = Some(v);
                }
                break;
            }
        }

        self.number(&mut inner)
    }

    /// Non-recursive DFS numbering pass, see spec.md §4.1.
    fn number(&self, inner: &mut Inner) -> Result<()> {
        if !inner.nodes.contains_key(&0) {
            return Err(Error::Invariant("no root version (id 0) present".into()));
        }

        let mut id: u32 = 0;
        let mut cur = Some(0u32);
        let mut down = true;

        while let Some(v) = cur {
            let mut next;

            if down {
                id += 1;
                let node = inner
                    .nodes
                    .get_mut(&v)
                    .ok_or_else(|| Error::Invariant(format!("unknown version {v}")))?;
                node.o_order = id;
                next = node.first_child;
                if next.is_none() {
                    node.r_order = node.o_order;
                }
            } else {
                let node = inner
                    .nodes
                    .get_mut(&v)
                    .ok_or_else(|| Error::Invariant(format!("unknown version {v}")))?;
                node.r_order = id;
                next = None;
            }

            down = true;
            if next.is_none() {
                next = inner.nodes.get(&v).and_then(|n| n.next_sibling);
            }
            if next.is_none() {
                next = inner.nodes.get(&v).and_then(|n| n.parent_id);
                down = false;
            }

            cur = next;
        }

        Ok(())
    }

    /// O(1) lookup of a version's routing root and size.
    pub fn snapshot_get(&self, version: VersionId) -> Result<(DiskBlock, u64)> {
        let vlock = self.version_lock(version);
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let _guard = vlock.read().expect("lock poisoned");

        let inner = self.lock();
        let node = inner.nodes.get(&version).ok_or(Error::NotFound)?;
        Ok((node.root_block, node.size))
    }

    /// O(1) ancestry test: `candidate is-ancestor-of version`.
    pub fn is_ancestor(&self, candidate: VersionId, version: VersionId) -> Result<bool> {
        let inner = self.lock();

        let v = inner.nodes.get(&version).ok_or(Error::NotFound)?;
        let c = inner.nodes.get(&candidate).ok_or(Error::NotFound)?;

        if !v.initialized || !c.initialized {
            return Err(Error::Invariant(
                "ancestry test against an uninitialized version".into(),
            ));
        }
        debug_assert_ne!(v.o_order, INVAL_ORDER);
        debug_assert_ne!(c.o_order, INVAL_ORDER);

        Ok(v.o_order >= c.o_order && v.o_order <= c.r_order)
    }

    /// Replaces `version`'s routing root. The caller conceptually holds the
    /// version's write lock for the duration of this call - that lock is
    /// taken internally here. A `root_update` whose `ct_seq` is older than
    /// the one already recorded is a stale, reordered write and is dropped
    /// rather than clobbering a newer root.
    pub fn root_update(&self, version: VersionId, ct_seq: u64, root_block: DiskBlock) -> Result<()> {
        let vlock = self.version_lock(version);
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let _guard = vlock.write().expect("lock poisoned");

        let mut inner = self.lock();
        let node = inner.nodes.get_mut(&version).ok_or(Error::NotFound)?;
        if ct_seq < node.last_updated_by_seq {
            log::warn!(
                "version {version} root_update from stale ct seq {ct_seq} dropped (last {})",
                node.last_updated_by_seq
            );
            return Ok(());
        }
        node.root_block = root_block;
        node.last_updated_by_seq = ct_seq;
        log::trace!("version {version} routing root updated by ct seq {ct_seq}");
        Ok(())
    }

    /// `seq` of the component tree that last won `root_update` for `version`.
    pub fn last_updated_by_seq(&self, version: VersionId) -> Result<u64> {
        let inner = self.lock();
        let node = inner.nodes.get(&version).ok_or(Error::NotFound)?;
        Ok(node.last_updated_by_seq)
    }

    /// Returns the DFS first-visit number used to total-order versions in
    /// the composite key/version order (spec.md §3): larger `o_order` means
    /// "visited later", which is how strict descendants are made to sort
    /// before their ancestors.
    pub fn o_order(&self, version: VersionId) -> Result<u32> {
        let inner = self.lock();
        let node = inner.nodes.get(&version).ok_or(Error::NotFound)?;
        if !node.initialized {
            return Err(Error::Invariant(format!(
                "o_order queried on uninitialized version {version}"
            )));
        }
        Ok(node.o_order)
    }

    /// Returns `(o_order, r_order)` for a version, mostly for tests.
    #[cfg(test)]
    fn orders(&self, version: VersionId) -> (u32, u32) {
        let inner = self.lock();
        let node = inner.nodes.get(&version).expect("version must exist");
        (node.o_order, node.r_order)
    }
}
