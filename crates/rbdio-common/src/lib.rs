//! rbdio Common - Shared types and utilities
//!
//! This crate provides the error type, value types, wire encoding helpers
//! and configuration used across all rbdio components.

pub mod config;
pub mod encoding;
pub mod error;
pub mod types;

pub use config::BlockConfig;
pub use encoding::{Decoder, Encoder};
pub use error::{Error, Result};
pub use types::*;
