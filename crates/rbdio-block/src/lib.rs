#![allow(clippy::result_large_err)]
//! rbdio Block Images
//!
//! This crate lays a linear, byte-addressable block device over an object
//! store. An image is a small header object plus one object per block, named
//! after a pool-unique prefix so that blocks of different images never
//! collide.
//!
//! # Features
//!
//! - **Sparse images**: blocks are only created on write
//! - **Snapshots**: self-managed snapshots with per-block rollback
//! - **Lifecycle**: create, delete, resize, rename and copy, including copies
//!   across pools
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │       Rbd       │  (one PoolSession per call)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    ImageOps     │
//! │  - Directory    │
//! │  - Snapshots    │
//! │  - BlockMapper  │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   ObjectStore   │  (rbd object class runs here)
//! └─────────────────┘
//! ```

pub mod bid;
pub mod bulk;
pub mod cls;
pub mod directory;
pub mod error;
pub mod header;
pub mod image;
pub mod mapper;
pub mod rbd;
pub mod session;
pub mod snapshot;

pub use cls::RbdClass;
pub use directory::Directory;
pub use error::{BlockError, BlockResult, FormatError};
pub use header::{CompType, CryptType, HEADER_SIZE, ImageHeader, InlineSnapshot};
pub use image::{ImageInfo, ImageOps};
pub use mapper::{BlockIndex, BlockMapper, BlockRange};
pub use rbd::Rbd;
pub use session::PoolSession;
pub use snapshot::{SnapshotInfo, SnapshotManager};

pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_EXTRA: u32 = 0;

/// Library version as `(major, minor, extra)`
#[must_use]
pub const fn version() -> (u32, u32, u32) {
    (VERSION_MAJOR, VERSION_MINOR, VERSION_EXTRA)
}
