//! Block storage error types

use thiserror::Error;

/// Image header and payload format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Fewer bytes than a complete header
    #[error("header truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// Block order cannot address a block
    #[error("invalid block order: {0}")]
    InvalidOrder(u8),

    /// Block name prefix is not printable ASCII
    #[error("invalid block name prefix")]
    InvalidBlockName,

    /// Inline snapshot table does not match the header counts
    #[error("corrupt snapshot table: {0}")]
    SnapshotTable(String),

    /// Server-side payload could not be decoded
    #[error("undecodable payload: {0}")]
    Payload(String),
}

/// Block storage error
#[derive(Error, Debug)]
pub enum BlockError {
    /// Image header not found
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Image header already exists
    #[error("Image already exists: {0}")]
    ImageExists(String),

    /// Snapshot not found
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Snapshot context read from the header is invalid
    #[error("Invalid snapshot context for image {0}")]
    InvalidSnapContext(String),

    /// Requested block order is out of range
    #[error("Invalid block order: {0}")]
    InvalidOrder(u8),

    /// Offset out of bounds
    #[error("Offset {offset} + length {length} exceeds image size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// Conditioned header write rejected because another writer got there first
    #[error("Header of {0} changed concurrently")]
    VersionConflict(String),

    /// Data returned by the store is inconsistent with its own extent map
    #[error("Data error: {0}")]
    DataError(String),

    /// Format error
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Object store error
    #[error("Store error: {0}")]
    Store(#[from] rbdio_common::Error),
}

impl BlockError {
    /// Check if this is an "absent" outcome rather than a failure
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ImageNotFound(_) | Self::SnapshotNotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Check if this is an optimistic-concurrency conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::VersionConflict(_) => true,
            Self::Store(e) => e.is_conflict(),
            _ => false,
        }
    }

    /// Check if this is a create/rename destination collision
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::ImageExists(_))
    }
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;
