//! Core types for rbdio
//!
//! Value types exchanged between the block layer and the object store.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Snapshot identifier allocated by the store's self-managed snapshot allocator
pub type SnapId = u64;

/// Opaque per-object revision marker used for optimistic concurrency
pub type Version = u64;

/// Handle to an open pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(u64);

impl PoolId {
    /// Wrap a raw handle number
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw handle number
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// Snapshot context scoping writes and rollbacks
///
/// `snaps` is kept in ascending order. A context is valid when every id is at
/// most `seq` and the ids are strictly ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    /// Last-assigned snapshot sequence
    pub seq: SnapId,
    /// Snapshot ids currently protecting the image's data objects
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    /// Build a context from an unordered list of ids
    #[must_use]
    pub fn new(seq: SnapId, mut snaps: Vec<SnapId>) -> Self {
        snaps.sort_unstable();
        Self { seq, snaps }
    }

    /// Check the context invariants
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.snaps.iter().all(|&id| id <= self.seq)
            && self.snaps.windows(2).all(|w| w[0] < w[1])
    }

    /// True when no snapshot protects the data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snaps.is_empty()
    }
}

/// Result of a stat call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    /// Object size in bytes
    pub size: u64,
    /// Current object version
    pub version: Version,
}

/// Result of a sparse read
///
/// `extents` maps offsets within the object to lengths. `data` holds the
/// bytes of every extent concatenated in offset order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseRead {
    /// Populated sub-ranges (offset -> length)
    pub extents: BTreeMap<u64, u64>,
    /// Concatenated extent data
    pub data: Bytes,
}

impl SparseRead {
    /// Total number of populated bytes
    #[must_use]
    pub fn populated_bytes(&self) -> u64 {
        self.extents.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_context_sorts_ids() {
        let snapc = SnapContext::new(9, vec![7, 2, 5]);
        assert_eq!(snapc.snaps, vec![2, 5, 7]);
        assert!(snapc.is_valid());
    }

    #[test]
    fn test_snap_context_invalid() {
        assert!(!SnapContext::new(3, vec![1, 4]).is_valid());
        assert!(!SnapContext::new(5, vec![2, 2]).is_valid());
        assert!(SnapContext::default().is_valid());
        assert!(SnapContext::default().is_empty());
    }

    #[test]
    fn test_sparse_read_populated() {
        let read = SparseRead {
            extents: BTreeMap::from([(100, 50), (4096, 10)]),
            data: Bytes::from(vec![0u8; 60]),
        };
        assert_eq!(read.populated_bytes(), 60);
    }
}
