// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The metadata store interface consumed by the core (spec.md §6):
//! `open`/`init`/`iterate`/`insert`/`update` over fixed-size records, keyed
//! by a stable key the store hands back on insert. The source's
//! `castle_da_writeback` marshals a descriptor, and only calls
//! `castle_mstore_entry_insert` the first time (`MSTORE_KEY_INVAL(key)`);
//! every later writeback goes through `castle_mstore_entry_update` against
//! the cached key. [`DoubleArrayRecord`] and [`ComponentTreeRecord`] mirror
//! its `castle_dlist_entry` / `castle_clist_entry` fields exactly.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A stable key handed back by [`MetadataStore::insert`] and required by
/// every later [`MetadataStore::update`] for that record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(u64);

/// Durable fields of a doubling array descriptor (spec.md §4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DoubleArrayRecord {
    pub id: u64,
    pub root_version: crate::version::VersionId,
}

/// Durable fields of a component tree descriptor (spec.md §4.3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentTreeRecord {
    pub da_id: u64,
    pub seq: u64,
    pub level: u32,
    pub btree_type: u32,
    pub dynamic: bool,
    pub item_count: u64,
    pub node_count: u64,
    pub first_node: crate::disk_block::DiskBlock,
    pub last_node: crate::disk_block::DiskBlock,
}

/// A single store's contract: fixed-size records of type `R`, keyed by a
/// store-assigned [`StoreKey`].
pub trait MetadataStore<R>: Send + Sync {
    /// Opens an existing store, failing if none exists.
    fn open(&self) -> Result<()>;

    /// Creates a fresh, empty store, discarding any prior contents.
    fn init(&self) -> Result<()>;

    /// Returns every `(record, key)` pair currently in the store.
    fn iterate(&self) -> Vec<(R, StoreKey)>;

    /// Inserts a new record, returning the key the store assigned it.
    fn insert(&self, record: R) -> StoreKey;

    /// Overwrites the record at an existing key.
    fn update(&self, key: StoreKey, record: R) -> Result<()>;
}

/// An in-memory store, sufficient for driving the core without a real
/// on-disk writeback path; a real deployment persists these records the
/// way the source's `castle_mstore` does.
pub struct InMemoryStore<R> {
    next_key: AtomicU64,
    records: RwLock<BTreeMap<u64, R>>,
}

impl<R> Default for InMemoryStore<R> {
    fn default() -> Self {
        Self {
            next_key: AtomicU64::new(0),
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<R: Clone + Send + Sync> MetadataStore<R> for InMemoryStore<R> {
    fn open(&self) -> Result<()> {
        // Nothing to distinguish "doesn't exist" from "exists and is
        // empty" without a real backing store; `init` is what resets state.
        Ok(())
    }

    fn init(&self) -> Result<()> {
        self.next_key.store(0, Ordering::Release);
        self.records.write().expect("lock poisoned").clear();
        Ok(())
    }

    fn iterate(&self) -> Vec<(R, StoreKey)> {
        self.records
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(k, r)| (r.clone(), StoreKey(*k)))
            .collect()
    }

    fn insert(&self, record: R) -> StoreKey {
        let key = self.next_key.fetch_add(1, Ordering::AcqRel);
        self.records
            .write()
            .expect("lock poisoned")
            .insert(key, record);
        StoreKey(key)
    }

    fn update(&self, key: StoreKey, record: R) -> Result<()> {
        let mut guard = self.records.write().expect("lock poisoned");
        if !guard.contains_key(&key.0) {
            return Err(Error::NotFound);
        }
        guard.insert(key.0, record);
        Ok(())
    }
}

/// Writes back a descriptor that may or may not have a cached key yet,
/// mirroring `castle_da_writeback`'s insert-once / update-thereafter
/// pattern. Returns the key to cache for the next writeback.
pub fn writeback<R: Clone + Send + Sync>(
    store: &dyn MetadataStore<R>,
    cached_key: Option<StoreKey>,
    record: R,
) -> Result<StoreKey> {
    match cached_key {
        None => Ok(store.insert(record)),
        Some(key) => {
            store.update(key, record)?;
            Ok(key)
        }
    }
}
