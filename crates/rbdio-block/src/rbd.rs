//! Entry point for block image operations
//!
//! [`Rbd`] holds the store and configuration. Every call opens a
//! [`PoolSession`] for the pool it names and drops it before returning, so
//! pool handles never outlive one operation.

use crate::error::BlockResult;
use crate::image::{ImageInfo, ImageOps};
use crate::session::PoolSession;
use crate::snapshot::SnapshotInfo;
use bytes::Bytes;
use rbdio_client::ObjectStore;
use rbdio_common::{BlockConfig, SnapId};
use std::sync::Arc;

/// Block image client
#[derive(Clone)]
pub struct Rbd {
    store: Arc<dyn ObjectStore>,
    config: BlockConfig,
}

impl std::fmt::Debug for Rbd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rbd")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Rbd {
    /// Client with the default configuration
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            config: BlockConfig::default(),
        }
    }

    /// Client with a validated configuration
    pub fn with_config(store: Arc<dyn ObjectStore>, config: BlockConfig) -> BlockResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    #[must_use]
    pub const fn config(&self) -> &BlockConfig {
        &self.config
    }

    async fn session(&self, pool: &str) -> BlockResult<PoolSession> {
        PoolSession::open(self.store.clone(), pool).await
    }

    pub async fn create_image(&self, pool: &str, name: &str, size: u64, order: u8) -> BlockResult<()> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config).create(name, size, order).await
    }

    pub async fn remove_image(&self, pool: &str, name: &str) -> BlockResult<()> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config).remove(name).await
    }

    pub async fn resize_image(&self, pool: &str, name: &str, size: u64) -> BlockResult<()> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config).resize(name, size).await
    }

    pub async fn stat_image(&self, pool: &str, name: &str) -> BlockResult<ImageInfo> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config).stat(name).await
    }

    pub async fn list_images(&self, pool: &str) -> BlockResult<Vec<String>> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config).list().await
    }

    pub async fn rename_image(&self, pool: &str, name: &str, new_name: &str) -> BlockResult<()> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config)
            .rename(name, new_name)
            .await
    }

    pub async fn copy_image(&self, pool: &str, name: &str, dest_name: &str) -> BlockResult<()> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config)
            .copy(name, dest_name)
            .await
    }

    /// Copy an image into another pool
    pub async fn copy_image_to(
        &self,
        pool: &str,
        name: &str,
        dest_pool: &str,
        dest_name: &str,
    ) -> BlockResult<()> {
        let src = self.session(pool).await?;
        let dest = self.session(dest_pool).await?;
        ImageOps::new(&src, &self.config)
            .copy_to(name, &ImageOps::new(&dest, &self.config), dest_name)
            .await
    }

    pub async fn list_snaps(&self, pool: &str, name: &str) -> BlockResult<Vec<SnapshotInfo>> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config)
            .list_snapshots(name)
            .await
    }

    pub async fn create_snap(&self, pool: &str, name: &str, snap_name: &str) -> BlockResult<SnapId> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config)
            .create_snapshot(name, snap_name)
            .await
    }

    pub async fn remove_snap(&self, pool: &str, name: &str, snap_name: &str) -> BlockResult<()> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config)
            .remove_snapshot(name, snap_name)
            .await
    }

    pub async fn rollback_snap(&self, pool: &str, name: &str, snap_name: &str) -> BlockResult<()> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config)
            .rollback_snapshot(name, snap_name)
            .await
    }

    /// Read `length` bytes of an image at `offset`
    pub async fn read(&self, pool: &str, name: &str, offset: u64, length: u64) -> BlockResult<Bytes> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config)
            .read_at(name, offset, length)
            .await
    }

    /// Write `data` into an image at `offset`
    pub async fn write(&self, pool: &str, name: &str, offset: u64, data: Bytes) -> BlockResult<()> {
        let session = self.session(pool).await?;
        ImageOps::new(&session, &self.config)
            .write_at(name, offset, data)
            .await
    }
}
