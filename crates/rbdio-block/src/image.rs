//! Image lifecycle operations
//!
//! Each operation is a short sequence of store calls. None of them is
//! transactional end to end: a failure leaves the steps already taken in
//! place, apart from the narrow compensations noted on each method. Delete
//! and resize-to-same-size are safe to re-run; create and rename report
//! `ImageExists` when a previous attempt got far enough to write a header.

use crate::bid::assign_bid;
use crate::bulk::{for_each_block, tolerate_not_found};
use crate::directory::Directory;
use crate::error::{BlockError, BlockResult};
use crate::header::ImageHeader;
use crate::mapper::BlockMapper;
use crate::session::PoolSession;
use crate::snapshot::{SnapshotInfo, SnapshotManager};
use bytes::{Bytes, BytesMut};
use rbdio_common::config::{MAX_ORDER, MIN_ORDER};
use rbdio_common::{BlockConfig, SnapId, Version};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Trim logs progress once per this many blocks
const TRIM_PROGRESS_INTERVAL: u64 = 128;

/// Largest byte count a single `read_at` returns
pub const MAX_READ_LENGTH: u64 = 1 << 30;

/// Summary of an image as reported by `stat`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Image size in bytes
    pub size: u64,
    /// Block object size in bytes
    pub obj_size: u64,
    /// Number of block objects covering the image
    pub num_objs: u64,
    pub order: u8,
    pub block_name_prefix: String,
}

/// Image operations within one pool session
#[derive(Debug)]
pub struct ImageOps<'a> {
    session: &'a PoolSession,
    config: &'a BlockConfig,
}

fn image_error(name: &str, e: rbdio_common::Error) -> BlockError {
    if e.is_not_found() {
        BlockError::ImageNotFound(name.to_string())
    } else {
        e.into()
    }
}

impl<'a> ImageOps<'a> {
    #[must_use]
    pub const fn new(session: &'a PoolSession, config: &'a BlockConfig) -> Self {
        Self { session, config }
    }

    fn directory(&self) -> Directory<'_> {
        Directory::new(self.session.md(), &self.config.directory_object)
    }

    fn snapshots<'b>(&'b self, name: &'b str) -> SnapshotManager<'b> {
        SnapshotManager::new(
            self.session,
            name,
            self.config.header_oid(name),
            self.config.bulk_concurrency,
        )
    }

    /// Raw header object contents and the version they were read at
    async fn read_header_bytes(&self, name: &str) -> BlockResult<(Bytes, Version)> {
        let md = self.session.md();
        let oid = self.config.header_oid(name);
        let chunk = self.config.header_read_chunk.max(1);

        let mut buf = BytesMut::new();
        let mut offset = 0u64;
        loop {
            let piece = md
                .read(&oid, offset, chunk)
                .await
                .map_err(|e| image_error(name, e))?;
            buf.extend_from_slice(&piece);
            offset += piece.len() as u64;
            if (piece.len() as u64) < chunk {
                break;
            }
        }
        let version = md.last_version()?;
        Ok((buf.freeze(), version))
    }

    /// Decoded header of `name` and its version
    pub async fn read_header(&self, name: &str) -> BlockResult<(ImageHeader, Version)> {
        let (raw, version) = self.read_header_bytes(name).await?;
        let header = ImageHeader::decode(&raw)?;
        Ok((header, version))
    }

    /// Write header bytes at offset zero, optionally conditioned on `version`
    ///
    /// Only the bytes given are replaced, so an inline snapshot table after
    /// a fixed-size header survives.
    async fn write_header(
        &self,
        oid: &str,
        raw: Bytes,
        version: Option<Version>,
    ) -> BlockResult<()> {
        let md = self.session.md();
        let written = match version {
            Some(v) => md.write_versioned(oid, 0, raw, v).await,
            None => md.write(oid, 0, raw).await,
        };
        if let Err(e) = written {
            if e.is_conflict() {
                warn!(oid, expected = ?version, "header changed concurrently");
                return Err(BlockError::VersionConflict(oid.to_string()));
            }
            return Err(e.into());
        }
        self.session.notify_header_change(oid, None).await;
        Ok(())
    }

    /// Remove the blocks of `header` beyond `new_size`
    async fn trim(&self, header: &ImageHeader, new_size: u64) -> BlockResult<()> {
        let mapper = BlockMapper::new(header)?;
        let start = mapper.block_count(new_size);
        let end = mapper.block_count(header.image_size);
        if start >= end {
            return Ok(());
        }
        info!(
            prefix = %header.block_name_prefix,
            from = start,
            to = end,
            "trimming blocks"
        );

        let data = self.session.data();
        let mapper = &mapper;
        for_each_block(start..end, self.config.bulk_concurrency, |index| async move {
            if (index - start) % TRIM_PROGRESS_INTERVAL == 0 {
                debug!(index, remaining = end - index, "trim progress");
            }
            tolerate_not_found(data.remove(&mapper.object_name(index)).await)
        })
        .await
    }

    /// Point the data handle at the image's current snapshot context
    async fn apply_snap_context(&self, name: &str) -> BlockResult<()> {
        let snapc = self.snapshots(name).current_context().await?;
        self.session.data().set_snap_context(&snapc)?;
        Ok(())
    }

    /// Create image `name`
    ///
    /// An `order` of zero selects the configured default. The directory
    /// entry is added before the header is written; if the header write
    /// fails the entry is left behind.
    pub async fn create(&self, name: &str, size: u64, order: u8) -> BlockResult<()> {
        let md = self.session.md();
        let oid = self.config.header_oid(name);
        if md.exists(&oid).await? {
            return Err(BlockError::ImageExists(name.to_string()));
        }
        if order != 0 && !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(BlockError::InvalidOrder(order));
        }

        let bid = assign_bid(md, &self.config.info_object).await?;
        let header = ImageHeader::create(size, order, bid, self.config.default_order);

        info!(image = name, "adding image to directory");
        self.directory().add(name).await?;

        info!(image = name, size, order = header.block_order, "writing header");
        self.write_header(&oid, header.encode(), None).await?;
        Ok(())
    }

    /// Delete image `name`
    ///
    /// A missing or undecodable header is tolerated so that an interrupted
    /// create or delete can be finished. Removing the header object is best
    /// effort. The directory entry goes last.
    pub async fn remove(&self, name: &str) -> BlockResult<()> {
        let oid = self.config.header_oid(name);
        let header_present = match self.read_header(name).await {
            Ok((header, _)) => {
                self.trim(&header, 0).await?;
                true
            }
            Err(e) if e.is_not_found() => {
                debug!(image = name, "no header, removing directory entry only");
                false
            }
            Err(BlockError::Format(e)) => {
                warn!(image = name, error = %e, "undecodable header, skipping block trim");
                true
            }
            Err(e) => return Err(e),
        };

        if header_present {
            info!(image = name, "removing header");
            if let Err(e) = tolerate_not_found(self.session.md().remove(&oid).await) {
                warn!(oid = %oid, error = %e, "failed to remove header");
            }
        }

        info!(image = name, "removing image from directory");
        self.directory().remove(name).await
    }

    /// Grow or shrink image `name` to `new_size` bytes
    ///
    /// The header write is conditioned on the version read, so a concurrent
    /// header update fails this call with `VersionConflict`.
    pub async fn resize(&self, name: &str, new_size: u64) -> BlockResult<()> {
        let (mut header, version) = self.read_header(name).await?;
        if header.image_size == new_size {
            return Ok(());
        }

        if new_size < header.image_size {
            info!(image = name, from = header.image_size, to = new_size, "shrinking image");
            self.apply_snap_context(name).await?;
            self.trim(&header, new_size).await?;
        } else {
            info!(image = name, from = header.image_size, to = new_size, "expanding image");
        }
        header.image_size = new_size;

        self.write_header(&self.config.header_oid(name), header.encode(), Some(version))
            .await
    }

    /// Rename image `name` to `new_name`
    ///
    /// The header is copied verbatim, snapshot table included. If the
    /// destination cannot be added to the directory its header is removed
    /// again. Removing the source is best effort.
    pub async fn rename(&self, name: &str, new_name: &str) -> BlockResult<()> {
        let md = self.session.md();
        let src_oid = self.config.header_oid(name);
        let dst_oid = self.config.header_oid(new_name);

        let (raw, _) = self.read_header_bytes(name).await?;
        if md.exists(&dst_oid).await? {
            return Err(BlockError::ImageExists(new_name.to_string()));
        }

        self.write_header(&dst_oid, raw, None).await?;
        if let Err(e) = self.directory().add(new_name).await {
            if let Err(cleanup) = tolerate_not_found(md.remove(&dst_oid).await) {
                warn!(oid = %dst_oid, error = %cleanup, "failed to remove destination header");
            }
            return Err(e);
        }

        if let Err(e) = self.directory().remove(name).await {
            warn!(image = name, error = %e, "failed to remove old directory entry");
        }
        if let Err(e) = tolerate_not_found(md.remove(&src_oid).await) {
            warn!(oid = %src_oid, error = %e, "failed to remove old header");
        }
        info!(from = name, to = new_name, "renamed image");
        Ok(())
    }

    /// Copy image `name` to `dest_name` in the same pool
    pub async fn copy(&self, name: &str, dest_name: &str) -> BlockResult<()> {
        self.copy_to(name, self, dest_name).await
    }

    /// Copy image `name` to `dest_name` in the pool behind `dest`
    ///
    /// Only populated extents of each source block are written, so the
    /// copy stays as sparse as the source. A failure leaves the blocks
    /// already copied in place.
    pub async fn copy_to(
        &self,
        name: &str,
        dest: &ImageOps<'_>,
        dest_name: &str,
    ) -> BlockResult<()> {
        let (src_header, _) = self.read_header(name).await?;
        dest.create(dest_name, src_header.image_size, src_header.block_order)
            .await?;
        let (dest_header, _) = dest.read_header(dest_name).await?;

        let src_mapper = BlockMapper::new(&src_header)?;
        let dest_mapper = BlockMapper::new(&dest_header)?;
        let count = src_mapper.block_count(src_header.image_size);
        let block_size = src_mapper.block_size();
        let src_data = self.session.data();
        let dest_data = dest.session.data();
        let (src_mapper, dest_mapper) = (&src_mapper, &dest_mapper);

        for_each_block(0..count, self.config.bulk_concurrency, |index| async move {
            let src_oid = src_mapper.object_name(index);
            let sparse = match src_data.sparse_read(&src_oid, 0, block_size).await {
                Ok(sparse) => sparse,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let dest_oid = dest_mapper.object_name(index);
            let mut cursor = 0usize;
            for (&offset, &length) in &sparse.extents {
                let end = usize::try_from(length)
                    .ok()
                    .and_then(|len| cursor.checked_add(len))
                    .filter(|end| *end <= sparse.data.len())
                    .ok_or_else(|| {
                        BlockError::DataError(format!(
                            "{src_oid}: extent {offset}+{length} past {} returned bytes",
                            sparse.data.len()
                        ))
                    })?;
                dest_data
                    .write(&dest_oid, offset, sparse.data.slice(cursor..end))
                    .await?;
                cursor = end;
            }
            Ok(())
        })
        .await?;

        info!(from = name, to = dest_name, blocks = count, "copied image");
        Ok(())
    }

    /// Size and layout of image `name`
    pub async fn stat(&self, name: &str) -> BlockResult<ImageInfo> {
        let (header, _) = self.read_header(name).await?;
        let mapper = BlockMapper::new(&header)?;
        Ok(ImageInfo {
            size: header.image_size,
            obj_size: mapper.block_size(),
            num_objs: mapper.block_count(header.image_size),
            order: header.block_order,
            block_name_prefix: header.block_name_prefix,
        })
    }

    /// Names of every image in the pool
    pub async fn list(&self) -> BlockResult<Vec<String>> {
        self.directory().list().await
    }

    fn check_bounds(header: &ImageHeader, offset: u64, length: u64) -> BlockResult<()> {
        match offset.checked_add(length) {
            Some(end) if end <= header.image_size => Ok(()),
            _ => Err(BlockError::OutOfBounds {
                offset,
                length,
                size: header.image_size,
            }),
        }
    }

    /// Read `length` bytes of image `name` at `offset`
    ///
    /// Never-written ranges read as zeros. Reads longer than
    /// [`MAX_READ_LENGTH`] are rejected.
    pub async fn read_at(&self, name: &str, offset: u64, length: u64) -> BlockResult<Bytes> {
        if length > MAX_READ_LENGTH {
            return Err(rbdio_common::Error::invalid_argument(format!(
                "read of {length} bytes exceeds {MAX_READ_LENGTH}"
            ))
            .into());
        }
        let (header, _) = self.read_header(name).await?;
        Self::check_bounds(&header, offset, length)?;
        let mapper = BlockMapper::new(&header)?;
        let block_size = mapper.block_size();
        let data = self.session.data();

        let mut out = BytesMut::zeroed(length as usize);
        for range in mapper.byte_range_to_blocks(offset, length) {
            let oid = mapper.object_name(range.index);
            let piece = match data.read(&oid, range.offset_in_block, range.length).await {
                Ok(piece) => piece,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            let start = (range.index * block_size + range.offset_in_block - offset) as usize;
            out[start..start + piece.len()].copy_from_slice(&piece);
        }
        Ok(out.freeze())
    }

    /// Write `buf` into image `name` at `offset`
    ///
    /// Writes carry the image's snapshot context so that existing snapshots
    /// keep the data being overwritten.
    pub async fn write_at(&self, name: &str, offset: u64, buf: Bytes) -> BlockResult<()> {
        let (header, _) = self.read_header(name).await?;
        Self::check_bounds(&header, offset, buf.len() as u64)?;
        let mapper = BlockMapper::new(&header)?;
        self.apply_snap_context(name).await?;
        let data = self.session.data();

        let mut cursor = 0usize;
        for range in mapper.byte_range_to_blocks(offset, buf.len() as u64) {
            let end = cursor + range.length as usize;
            data.write(
                &mapper.object_name(range.index),
                range.offset_in_block,
                buf.slice(cursor..end),
            )
            .await?;
            cursor = end;
        }
        Ok(())
    }

    /// Snapshots of image `name` in header order
    pub async fn list_snapshots(&self, name: &str) -> BlockResult<Vec<SnapshotInfo>> {
        let (_, snaps) = self.snapshots(name).list().await?;
        Ok(snaps)
    }

    pub async fn create_snapshot(&self, name: &str, snap_name: &str) -> BlockResult<SnapId> {
        self.snapshots(name).create(snap_name).await
    }

    pub async fn remove_snapshot(&self, name: &str, snap_name: &str) -> BlockResult<()> {
        self.snapshots(name).remove(snap_name).await
    }

    /// Roll every block of image `name` back to snapshot `snap_name`
    pub async fn rollback_snapshot(&self, name: &str, snap_name: &str) -> BlockResult<()> {
        let (header, _) = self.read_header(name).await?;
        self.snapshots(name).rollback(snap_name, &header).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cls::RbdClass;
    use crate::header::HEADER_SIZE;
    use rbdio_client::{FaultOp, MemStore};
    use rbdio_common::Error;
    use std::sync::Arc;

    const MIB: u64 = 1024 * 1024;

    async fn setup() -> (Arc<MemStore>, PoolSession, BlockConfig) {
        let store = Arc::new(MemStore::new().with_pool("rbd").with_class(Arc::new(RbdClass)));
        let session = PoolSession::open(store.clone(), "rbd").await.unwrap();
        (store, session, BlockConfig::default())
    }

    #[tokio::test]
    async fn test_create_and_stat() {
        let (store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 4096, 22).await.unwrap();

        let info = ops.stat("foo").await.unwrap();
        assert_eq!(info.size, 4096);
        assert_eq!(info.obj_size, 4 * MIB);
        assert_eq!(info.num_objs, 1);
        assert_eq!(info.order, 22);
        assert_eq!(info.block_name_prefix, "rb.0.1");
        assert_eq!(ops.list().await.unwrap(), vec!["foo"]);
        assert_eq!(store.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_create_default_order() {
        let (_store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", MIB, 0).await.unwrap();
        assert_eq!(ops.stat("foo").await.unwrap().order, 22);
    }

    #[tokio::test]
    async fn test_create_existing() {
        let (_store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 4096, 22).await.unwrap();
        let err = ops.create("foo", 8192, 22).await.unwrap_err();
        assert!(matches!(err, BlockError::ImageExists(_)));
        assert_eq!(ops.stat("foo").await.unwrap().size, 4096);
    }

    #[tokio::test]
    async fn test_create_rejects_order() {
        let (store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        let err = ops.create("foo", 4096, 40).await.unwrap_err();
        assert!(matches!(err, BlockError::InvalidOrder(40)));
        assert!(store.object_names("rbd").is_empty());
    }

    #[tokio::test]
    async fn test_header_read_spans_chunks() {
        let (_store, session, _) = setup().await;
        let config = BlockConfig {
            header_read_chunk: 16,
            ..BlockConfig::default()
        };
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 4096, 12).await.unwrap();
        ops.create_snapshot("foo", "s1").await.unwrap();

        let (raw, version) = ops.read_header_bytes("foo").await.unwrap();
        assert!(raw.len() > HEADER_SIZE);
        assert!(version > 0);
        assert_eq!(ops.read_header("foo").await.unwrap().0.snapshot_count, 1);
    }

    #[tokio::test]
    async fn test_missing_image() {
        let (_store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        assert!(matches!(
            ops.stat("ghost").await.unwrap_err(),
            BlockError::ImageNotFound(_)
        ));
        assert!(matches!(
            ops.resize("ghost", 1).await.unwrap_err(),
            BlockError::ImageNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let (_store, session, config) = setup().await;
        session
            .md()
            .write("foo.rbd", 0, Bytes::from_static(b"too short"))
            .await
            .unwrap();
        let ops = ImageOps::new(&session, &config);
        assert!(matches!(
            ops.stat("foo").await.unwrap_err(),
            BlockError::Format(crate::error::FormatError::Truncated { .. })
        ));
    }

    #[tokio::test]
    async fn test_resize_same_size_is_noop() {
        let (store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 4096, 12).await.unwrap();
        let notified = store.notifications().len();
        ops.resize("foo", 4096).await.unwrap();
        assert_eq!(store.notifications().len(), notified);
    }

    #[tokio::test]
    async fn test_resize_grow_keeps_blocks() {
        let (store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 4096, 12).await.unwrap();
        ops.write_at("foo", 0, Bytes::from_static(b"data")).await.unwrap();
        ops.resize("foo", 3 * 4096).await.unwrap();

        assert_eq!(ops.stat("foo").await.unwrap().num_objs, 3);
        assert!(store.object_names("rbd").contains(&"rb.0.1.000000000000".to_string()));
        assert_eq!(
            ops.read_at("foo", 0, 4).await.unwrap(),
            Bytes::from_static(b"data")
        );
    }

    #[tokio::test]
    async fn test_resize_conflict() {
        let (store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 4 * 4096, 12).await.unwrap();
        ops.write_at("foo", 3 * 4096, Bytes::from_static(b"x"))
            .await
            .unwrap();

        // Another writer touches the header between our read and write.
        store.fail_next(
            FaultOp::Write,
            Some("foo.rbd"),
            Error::VersionConflict {
                oid: "foo.rbd".into(),
                expected: 1,
                actual: 2,
            },
        );
        let err = ops.resize("foo", 4096).await.unwrap_err();
        assert!(matches!(err, BlockError::VersionConflict(_)));
        assert!(err.is_conflict());
        assert_eq!(ops.stat("foo").await.unwrap().size, 4 * 4096);
    }

    #[tokio::test]
    async fn test_remove_tolerates_missing_header() {
        let (store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 4096, 12).await.unwrap();
        ops.write_at("foo", 0, Bytes::from_static(b"x")).await.unwrap();

        ops.remove("foo").await.unwrap();
        ops.remove("foo").await.unwrap();
        assert!(ops.list().await.unwrap().is_empty());
        let left = store.object_names("rbd");
        assert_eq!(left, vec!["rbd_directory", "rbd_info"]);
    }

    #[tokio::test]
    async fn test_remove_aborts_on_trim_failure() {
        let (store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 2 * 4096, 12).await.unwrap();
        ops.write_at("foo", 0, Bytes::from(vec![1u8; 8192])).await.unwrap();

        store.fail_next(FaultOp::Remove, Some("rb.0.1.000000000001"), Error::Timeout);
        assert!(ops.remove("foo").await.is_err());
        // Header and directory entry survive for a retry.
        assert_eq!(ops.list().await.unwrap(), vec!["foo"]);
        ops.remove("foo").await.unwrap();
        assert!(ops.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_write_bounds() {
        let (_store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 4096, 12).await.unwrap();
        let err = ops
            .write_at("foo", 4090, Bytes::from_static(b"too long"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::OutOfBounds { size: 4096, .. }));
        assert!(ops.read_at("foo", u64::MAX, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_write_spanning_blocks() {
        let (store, session, config) = setup().await;
        let ops = ImageOps::new(&session, &config);
        ops.create("foo", 3 * 4096, 12).await.unwrap();
        let payload: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        ops.write_at("foo", 3000, Bytes::from(payload.clone()))
            .await
            .unwrap();

        let back = ops.read_at("foo", 3000, 6000).await.unwrap();
        assert_eq!(&back[..], &payload[..]);
        let head = ops.read_at("foo", 0, 3000).await.unwrap();
        assert!(head.iter().all(|b| *b == 0));
        assert_eq!(
            store.object_data("rbd", "rb.0.1.000000000001").unwrap().len(),
            4096
        );
    }
}
