// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Merged Iterator (spec.md §4.5): a k-way (`N ≤ Config::max_merge_inputs`)
//! streaming merge over component iterators, each holding at most one
//! cached lookahead entry. The source's `castle_ct_merged_iter_*` keeps a
//! small fixed-size array of per-component slots rather than a general
//! priority queue - `N` is always small (≤10), so this does the same: a
//! linear scan over the lookahead array picks the global minimum each step.

use crate::btree::{composite_compare, BTreeType, Key};
use crate::disk_block::DiskBlock;
use crate::error::{Error, Result};
use crate::version::{VersionId, VersionIndex};

/// One upstream component: anything that can be asked for its next
/// `(key, version, value-ref)` triple in composite order.
pub trait MergeInput {
    fn has_next(&self) -> bool;
    fn next(&mut self) -> Option<(Key, VersionId, DiskBlock)>;
}

impl MergeInput for crate::modlist_iter::ModlistIterator {
    fn has_next(&self) -> bool {
        crate::modlist_iter::ModlistIterator::has_next(self)
    }

    fn next(&mut self) -> Option<(Key, VersionId, DiskBlock)> {
        crate::modlist_iter::ModlistIterator::next(self)
    }
}

struct Component {
    input: Box<dyn MergeInput>,
    cache: Option<(Key, VersionId, DiskBlock)>,
    completed: bool,
}

/// Streams the globally sorted composite-order merge of its inputs.
pub struct MergedIterator<'a> {
    btree: &'a dyn BTreeType,
    versions: &'a VersionIndex,
    components: Vec<Component>,
    non_empty_count: usize,
    errored: bool,
}

impl<'a> MergedIterator<'a> {
    /// `inputs.len()` must not exceed `max_inputs` (`Config::max_merge_inputs`);
    /// exceeding it is rejected here rather than left to the caller.
    pub fn new(
        inputs: Vec<Box<dyn MergeInput>>,
        btree: &'a dyn BTreeType,
        versions: &'a VersionIndex,
        max_inputs: usize,
    ) -> Result<Self> {
        if inputs.len() > max_inputs {
            return Err(Error::InvalidInput(format!(
                "merge fan-in {} exceeds max_merge_inputs {max_inputs}",
                inputs.len()
            )));
        }
        let non_empty_count = inputs.len();
        let components = inputs
            .into_iter()
            .map(|input| Component {
                input,
                cache: None,
                completed: false,
            })
            .collect();

        Ok(Self {
            btree,
            versions,
            components,
            non_empty_count,
            errored: false,
        })
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.non_empty_count > 0 && !self.errored
    }

    fn refill(&mut self) -> Result<()> {
        for component in &mut self.components {
            if component.completed || component.cache.is_some() {
                continue;
            }
            if component.input.has_next() {
                component.cache = component.input.next();
                if component.cache.is_none() {
                    component.completed = true;
                    self.non_empty_count -= 1;
                }
            } else {
                component.completed = true;
                self.non_empty_count -= 1;
            }
        }
        Ok(())
    }

    pub fn next(&mut self) -> Result<Option<(Key, VersionId, DiskBlock)>> {
        if !self.has_next() {
            return Ok(None);
        }

        if let Err(e) = self.refill() {
            self.errored = true;
            return Err(e);
        }

        let mut winner: Option<usize> = None;
        for (i, component) in self.components.iter().enumerate() {
            let Some((key, version, _)) = &component.cache else {
                continue;
            };
            winner = match winner {
                None => Some(i),
                Some(w) => {
                    let (wk, wv, _) = self.components[w].cache.as_ref().expect("cached");
                    match composite_compare(self.btree, key, *version, wk, *wv, |v| {
                        self.versions.o_order(v)
                    }) {
                        Ok(std::cmp::Ordering::Less) => Some(i),
                        Ok(std::cmp::Ordering::Greater) => Some(w),
                        Ok(std::cmp::Ordering::Equal) => {
                            self.errored = true;
                            return Err(Error::Invariant(
                                "duplicate (key, version) entry across merge inputs".to_string(),
                            ));
                        }
                        Err(e) => {
                            self.errored = true;
                            return Err(e);
                        }
                    }
                }
            };
        }

        let Some(winner) = winner else {
            return Ok(None);
        };
        let entry = self.components[winner].cache.take();
        if self.components[winner].input.has_next() {
            // Leave cache empty; it is refilled on the next call.
        } else {
            self.components[winner].completed = true;
            self.non_empty_count = self.non_empty_count.saturating_sub(1);
        }
        Ok(entry)
    }
}
