//! rbdio Client - Object-store capability interface
//!
//! This crate defines the narrow interface the block layer uses to reach the
//! object store, plus an in-memory implementation of it.

pub mod class;
pub mod mem;
pub mod store;
pub mod tmap;

// Re-exports
pub use class::{ClassContext, ObjectClass};
pub use mem::{FaultOp, MemStore, Notification};
pub use store::{ObjectStore, Pool};
pub use tmap::{Tmap, TmapEdit};
