// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Errors surfaced by the versioned storage core.
///
/// The data path never returns [`Error::NotFound`] for a missing key - that
/// case is represented by `Absent` on the relevant `find`/router return
/// types. `NotFound` is reserved for control-path lookups (an unknown
/// version or doubling array id).
#[derive(Debug)]
pub enum Error {
    /// A buffer or iterator allocation failed.
    OutOfMemory,

    /// A control-path lookup (version, doubling array) found nothing.
    NotFound,

    /// A `BTreeType` produced a non-total order, or a merge input stream was
    /// non-monotonic, or two merge inputs disagreed on `btree_type`.
    InvalidInput(String),

    /// The page cache or free-space allocator reported an I/O failure.
    Storage(std::io::Error),

    /// A detected invariant break (e.g. ancestry test on an uninitialized
    /// version). Never recovered from; the caller must abort the operation.
    Invariant(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VersionedDaError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value)
    }
}

/// Core result type.
pub type Result<T> = std::result::Result<T, Error>;
