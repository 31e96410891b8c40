// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Tuning parameters for a doubling array / merge engine instance.
///
/// The source hard-codes its level-0 sealing threshold in a debug branch;
/// here it's a configuration parameter, since none of the core's
/// correctness depends on its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of items the level-0 dynamic CT may hold before it is sealed
    /// and demoted to level 1.
    ///
    /// Defaults to 1000.
    pub sealing_threshold: u64,

    /// Maximum depth the merge engine's work-state ladder may reach.
    ///
    /// Defaults to 8.
    pub max_btree_depth: usize,

    /// Size of a single B-tree node, in blocks.
    ///
    /// Defaults to 1.
    pub node_size_blocks: u32,

    /// Size of a single block, in bytes.
    ///
    /// Defaults to 4096.
    pub block_size_bytes: u32,

    /// Maximum number of component iterators a single merged iterator may
    /// fan in over (spec bounds this at 10).
    ///
    /// Defaults to 10.
    pub max_merge_inputs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sealing_threshold: 1_000,
            max_btree_depth: 8,
            node_size_blocks: 1,
            block_size_bytes: 4_096,
            max_merge_inputs: 10,
        }
    }
}

impl Config {
    /// Creates a config with default tuning.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the level-0 sealing threshold.
    #[must_use]
    pub fn sealing_threshold(mut self, items: u64) -> Self {
        self.sealing_threshold = items;
        self
    }

    /// Sets the maximum merge-engine work-state depth.
    #[must_use]
    pub fn max_btree_depth(mut self, depth: usize) -> Self {
        self.max_btree_depth = depth;
        self
    }

    /// Sets the B-tree node size, in blocks.
    #[must_use]
    pub fn node_size_blocks(mut self, blocks: u32) -> Self {
        self.node_size_blocks = blocks;
        self
    }

    /// Sets the block size, in bytes.
    #[must_use]
    pub fn block_size_bytes(mut self, bytes: u32) -> Self {
        self.block_size_bytes = bytes;
        self
    }

    /// Sets the maximum fan-in of a single merged iterator.
    #[must_use]
    pub fn max_merge_inputs(mut self, n: usize) -> Self {
        self.max_merge_inputs = n;
        self
    }
}
