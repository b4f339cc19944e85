//! Error types for rbdio
//!
//! This module defines the store-level error type shared by the object-store
//! client and the block layer built on top of it.

use thiserror::Error;

/// Common result type for object-store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for object-store operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    // Object errors
    #[error("object not found: {pool}/{oid}")]
    ObjectNotFound { pool: String, oid: String },

    #[error("object already exists: {pool}/{oid}")]
    ObjectAlreadyExists { pool: String, oid: String },

    #[error("version conflict on {oid}: expected {expected}, found {actual}")]
    VersionConflict {
        oid: String,
        expected: u64,
        actual: u64,
    },

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("snapshot id not found: {0}")]
    SnapshotIdNotFound(u64),

    #[error("object class not found: {0}")]
    ClassNotFound(String),

    #[error("object class method not found: {class}.{method}")]
    MethodNotFound { class: String, method: String },

    // Space errors, passed through verbatim
    #[error("insufficient space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("pool is full")]
    DiskFull,

    // Transport errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    // Request errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an object not found error
    pub fn not_found(pool: impl Into<String>, oid: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            pool: pool.into(),
            oid: oid.into(),
        }
    }

    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    ///
    /// Several call sites treat an absent object as a normal outcome, so this
    /// is kept separate from every other failure.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ObjectNotFound { .. }
                | Self::PoolNotFound(_)
                | Self::SnapshotIdNotFound(_)
        )
    }

    /// Check if this is a failed version assertion
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionFailed(_))
    }

    /// Check if this is an out-of-space error
    #[must_use]
    pub const fn is_out_of_space(&self) -> bool {
        matches!(self, Self::InsufficientSpace { .. } | Self::DiskFull)
    }
}
