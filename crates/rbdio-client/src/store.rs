//! Object-store capability interface
//!
//! The block layer talks to the object store only through [`ObjectStore`].
//! Every call is a request/response against one pool handle. Pool handles
//! carry local state (the write snapshot context and the version observed by
//! the last operation), like a RADOS I/O context.

use async_trait::async_trait;
use bytes::Bytes;
use rbdio_common::{ObjectStat, PoolId, Result, SnapContext, SnapId, SparseRead, Version};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Operations the block layer needs from an object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store name for logging
    fn name(&self) -> &str;

    /// Open a handle on a named pool
    async fn open_pool(&self, pool: &str) -> Result<PoolId>;

    /// Release a pool handle. Unknown handles are ignored.
    fn close_pool(&self, pool: PoolId);

    /// Set the snapshot context applied to subsequent writes on this handle
    fn set_snap_context(&self, pool: PoolId, snapc: &SnapContext) -> Result<()>;

    /// Version of the object touched by the handle's last operation
    fn get_last_version(&self, pool: PoolId) -> Result<Version>;

    /// Read up to `len` bytes at `offset`. `len == 0` reads to the end.
    ///
    /// A missing object is `ObjectNotFound`. A short result means the object
    /// ended before `offset + len`.
    async fn read(&self, pool: PoolId, oid: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Read only the populated sub-ranges of `[offset, offset + len)`
    async fn sparse_read(&self, pool: PoolId, oid: &str, offset: u64, len: u64)
    -> Result<SparseRead>;

    /// Write `data` at `offset`, creating the object if needed
    ///
    /// With `assert_version` set, the write fails with `VersionConflict` unless
    /// the object is still at that version.
    async fn write(
        &self,
        pool: PoolId,
        oid: &str,
        offset: u64,
        data: Bytes,
        assert_version: Option<Version>,
    ) -> Result<()>;

    /// Remove an object
    async fn remove(&self, pool: PoolId, oid: &str) -> Result<()>;

    /// Existence probe
    async fn stat(&self, pool: PoolId, oid: &str) -> Result<ObjectStat>;

    /// Invoke a server-side object class method
    async fn exec(
        &self,
        pool: PoolId,
        oid: &str,
        class: &str,
        method: &str,
        input: Bytes,
    ) -> Result<Bytes>;

    /// Apply an encoded edit to an atomically-updated ordered map object
    async fn tmap_update(&self, pool: PoolId, oid: &str, edit: Bytes) -> Result<()>;

    /// Allocate a new self-managed snapshot id
    async fn selfmanaged_snap_create(&self, pool: PoolId) -> Result<SnapId>;

    /// Release a self-managed snapshot id
    async fn selfmanaged_snap_remove(&self, pool: PoolId, snap: SnapId) -> Result<()>;

    /// Roll one object back to its contents as of `target`
    async fn selfmanaged_snap_rollback_object(
        &self,
        pool: PoolId,
        oid: &str,
        snapc: &SnapContext,
        target: SnapId,
    ) -> Result<()>;

    /// Broadcast a change notification to watchers of `oid`
    async fn notify(&self, pool: PoolId, oid: &str, version: Version) -> Result<()>;
}

/// An open pool handle, released when dropped
pub struct Pool {
    store: Arc<dyn ObjectStore>,
    id: PoolId,
    name: String,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("store", &self.store.name())
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Pool {
    /// Open a handle on `name`
    pub async fn open(store: Arc<dyn ObjectStore>, name: &str) -> Result<Self> {
        let id = store.open_pool(name).await?;
        trace!(pool = name, %id, "opened pool handle");
        Ok(Self {
            store,
            id,
            name: name.to_string(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> PoolId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn set_snap_context(&self, snapc: &SnapContext) -> Result<()> {
        self.store.set_snap_context(self.id, snapc)
    }

    pub fn last_version(&self) -> Result<Version> {
        self.store.get_last_version(self.id)
    }

    pub async fn read(&self, oid: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.store.read(self.id, oid, offset, len).await
    }

    pub async fn sparse_read(&self, oid: &str, offset: u64, len: u64) -> Result<SparseRead> {
        self.store.sparse_read(self.id, oid, offset, len).await
    }

    pub async fn write(&self, oid: &str, offset: u64, data: Bytes) -> Result<()> {
        self.store.write(self.id, oid, offset, data, None).await
    }

    /// Write conditioned on the object still being at `version`
    pub async fn write_versioned(
        &self,
        oid: &str,
        offset: u64,
        data: Bytes,
        version: Version,
    ) -> Result<()> {
        self.store
            .write(self.id, oid, offset, data, Some(version))
            .await
    }

    pub async fn remove(&self, oid: &str) -> Result<()> {
        self.store.remove(self.id, oid).await
    }

    pub async fn stat(&self, oid: &str) -> Result<ObjectStat> {
        self.store.stat(self.id, oid).await
    }

    /// Existence probe mapping `ObjectNotFound` to `false`
    pub async fn exists(&self, oid: &str) -> Result<bool> {
        match self.store.stat(self.id, oid).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn exec(&self, oid: &str, class: &str, method: &str, input: Bytes) -> Result<Bytes> {
        self.store.exec(self.id, oid, class, method, input).await
    }

    pub async fn tmap_update(&self, oid: &str, edit: Bytes) -> Result<()> {
        self.store.tmap_update(self.id, oid, edit).await
    }

    pub async fn snap_create(&self) -> Result<SnapId> {
        self.store.selfmanaged_snap_create(self.id).await
    }

    pub async fn snap_remove(&self, snap: SnapId) -> Result<()> {
        self.store.selfmanaged_snap_remove(self.id, snap).await
    }

    pub async fn snap_rollback_object(
        &self,
        oid: &str,
        snapc: &SnapContext,
        target: SnapId,
    ) -> Result<()> {
        self.store
            .selfmanaged_snap_rollback_object(self.id, oid, snapc, target)
            .await
    }

    pub async fn notify(&self, oid: &str, version: Version) -> Result<()> {
        self.store.notify(self.id, oid, version).await
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.store.close_pool(self.id);
        trace!(pool = %self.name, id = %self.id, "closed pool handle");
    }
}
