//! Server-side object classes
//!
//! An object class is a named set of procedures that run next to the data,
//! against exactly one object, and either commit their write or leave the
//! object untouched.

use bytes::Bytes;
use rbdio_common::{Error, Result};

/// A named set of server-side procedures
pub trait ObjectClass: Send + Sync {
    /// Class name used in `exec` calls
    fn name(&self) -> &str;

    /// Run `method` against the object behind `ctx`
    fn call(&self, method: &str, ctx: &mut ClassContext<'_>, input: &[u8]) -> Result<Bytes>;
}

/// The object a class method operates on
///
/// Changes are staged here and committed by the store only when the method
/// returns `Ok`.
#[derive(Debug)]
pub struct ClassContext<'a> {
    pool: &'a str,
    oid: &'a str,
    data: Option<Vec<u8>>,
    dirty: bool,
}

impl<'a> ClassContext<'a> {
    /// Wrap the current contents of an object, `None` if it does not exist
    #[must_use]
    pub const fn new(pool: &'a str, oid: &'a str, data: Option<Vec<u8>>) -> Self {
        Self {
            pool,
            oid,
            data,
            dirty: false,
        }
    }

    #[must_use]
    pub const fn pool(&self) -> &str {
        self.pool
    }

    #[must_use]
    pub const fn oid(&self) -> &str {
        self.oid
    }

    #[must_use]
    pub const fn exists(&self) -> bool {
        self.data.is_some()
    }

    /// Full object contents
    pub fn read(&self) -> Result<&[u8]> {
        self.data
            .as_deref()
            .ok_or_else(|| Error::not_found(self.pool, self.oid))
    }

    /// Replace the full object contents
    pub fn write_full(&mut self, data: Vec<u8>) {
        self.data = Some(data);
        self.dirty = true;
    }

    /// Staged contents, if the method wrote anything
    #[must_use]
    pub fn into_update(self) -> Option<Vec<u8>> {
        if self.dirty { self.data } else { None }
    }
}
