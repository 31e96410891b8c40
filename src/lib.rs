// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A versioned, write-optimized storage engine core.
//!
//! ##### NOTE
//!
//! > This crate only provides the core: a version forest with O(1) ancestry
//! > tests, a doubling-array (leveled) component-tree organization, and a
//! > streaming merge engine. It does not ship block compression, a
//! > write-ahead log, or crash recovery - those are layered on top of the
//! > collaborator traits in [`cache`], [`free_space`], and
//! > [`metadata_store`].
//!
//! ##### About
//!
//! Every write lands in a single mutable **dynamic** component tree (CT) per
//! [`doubling_array::DoublingArray`]; once it grows past a configured
//! threshold it is *sealed* and demoted down the array, where the merge
//! engine eventually folds it together with its level-mates into a new,
//! immutable **static** CT one level up. A point read walks the array level
//! by level, newest CT first within a level, so the freshest write for a key
//! always wins.
//!
//! Versions form a forest, not a single timeline: any version may be
//! snapshotted to create a child, and a read at version `V` sees the most
//! recent write made at `V` or any of `V`'s ancestors. [`version::VersionIndex`]
//! answers "is A an ancestor of B" in O(1) via a DFS numbering, the same way
//! the component trees' composite key order sorts a descendant before its
//! ancestor for the same key.
//!
//! # Example usage
//!
//! ```
//! use versioned_da::btree::simple::ByteKeyType;
//! use versioned_da::cache::InMemoryCache;
//! use versioned_da::config::Config;
//! use versioned_da::disk_block::DiskBlock;
//! use versioned_da::doubling_array::DoublingArray;
//! use versioned_da::free_space::InMemoryFreeSpace;
//! use versioned_da::version::VersionIndex;
//! use std::sync::Arc;
//!
//! # fn main() -> versioned_da::error::Result<()> {
//! let versions = Arc::new(VersionIndex::new());
//! versions.add(0, None, DiskBlock::new(1, 1), 0)?;
//! versions.process()?;
//!
//! let da = DoublingArray::new(
//!     1,
//!     Arc::new(ByteKeyType::default()),
//!     Arc::new(InMemoryCache::default()),
//!     Arc::new(InMemoryFreeSpace::default()),
//!     versions,
//!     Config::new(),
//! )?;
//!
//! da.insert(b"hello".to_vec(), 0, DiskBlock::new(2, 1))?;
//! assert_eq!(da.find(b"hello", 0)?, Some(DiskBlock::new(2, 1)));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]

pub mod btree;
pub mod cache;
pub mod component_tree;
pub mod config;
pub mod disk_block;
pub mod doubling_array;
pub mod error;
pub mod free_space;
pub mod merge;
pub mod merged_iter;
pub mod metadata_store;
pub mod modlist_iter;
pub mod version;

pub use cache::{BlockRef, InMemoryCache, PageCache};
pub use component_tree::{ComponentTree, CtStats, DynamicComponentTree, StaticComponentTree};
pub use config::Config;
pub use disk_block::DiskBlock;
pub use doubling_array::{DoublingArray, MergeStepOutcome};
pub use error::{Error, Result};
pub use free_space::{FreeSpaceAllocator, InMemoryFreeSpace};
pub use merge::{MergeOutcome, MergeResult};
pub use merged_iter::{MergeInput, MergedIterator};
pub use metadata_store::{
    writeback, ComponentTreeRecord, DoubleArrayRecord, InMemoryStore, MetadataStore, StoreKey,
};
pub use modlist_iter::ModlistIterator;
pub use version::{VersionId, VersionIndex};
