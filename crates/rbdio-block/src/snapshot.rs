//! Image snapshots
//!
//! Snapshot ids are allocated pool-wide by the store. The id, name and
//! image size at snapshot time live in the inline table of the image
//! header, maintained by the `rbd` class. Block objects are cloned lazily
//! by the store on the first write after a snapshot, which is why every
//! data write carries the image's snapshot context.

use crate::bulk::{for_each_block, tolerate_not_found};
use crate::cls::{CLASS_NAME, METHOD_SNAP_ADD, METHOD_SNAP_LIST, METHOD_SNAP_REMOVE};
use crate::error::{BlockError, BlockResult, FormatError};
use crate::header::ImageHeader;
use crate::mapper::BlockMapper;
use crate::session::PoolSession;
use bytes::Bytes;
use rbdio_common::{Decoder, Encoder, SnapContext, SnapId};
use serde::Serialize;
use tracing::{debug, info, warn};

/// A snapshot as listed from the image header
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub id: SnapId,
    pub name: String,
    /// Image size when the snapshot was taken
    pub size: u64,
}

/// Snapshot operations on one image
#[derive(Debug)]
pub struct SnapshotManager<'a> {
    session: &'a PoolSession,
    image_name: &'a str,
    header_oid: String,
    concurrency: usize,
}

fn decode_snap_list(raw: &[u8]) -> rbdio_common::Result<(SnapId, Vec<SnapshotInfo>)> {
    let mut dec = Decoder::new(raw);
    let seq = dec.get_u64()?;
    let count = dec.get_u32()?;
    let mut snaps = Vec::new();
    for _ in 0..count {
        let id = dec.get_u64()?;
        let size = dec.get_u64()?;
        let name = dec.get_string()?;
        snaps.push(SnapshotInfo { id, name, size });
    }
    Ok((seq, snaps))
}

impl<'a> SnapshotManager<'a> {
    #[must_use]
    pub fn new(
        session: &'a PoolSession,
        image_name: &'a str,
        header_oid: String,
        concurrency: usize,
    ) -> Self {
        Self {
            session,
            image_name,
            header_oid,
            concurrency,
        }
    }

    fn image_error(&self, e: rbdio_common::Error) -> BlockError {
        if e.is_not_found() {
            BlockError::ImageNotFound(self.image_name.to_string())
        } else {
            e.into()
        }
    }

    /// Snapshot sequence and every snapshot in header order
    pub async fn list(&self) -> BlockResult<(SnapId, Vec<SnapshotInfo>)> {
        let raw = self
            .session
            .md()
            .exec(&self.header_oid, CLASS_NAME, METHOD_SNAP_LIST, Bytes::new())
            .await
            .map_err(|e| self.image_error(e))?;
        let listed =
            decode_snap_list(&raw).map_err(|e| FormatError::Payload(format!("snap_list: {e}")))?;
        Ok(listed)
    }

    fn context_from(&self, seq: SnapId, snaps: &[SnapshotInfo]) -> BlockResult<SnapContext> {
        let snapc = SnapContext::new(seq, snaps.iter().map(|s| s.id).collect());
        if !snapc.is_valid() {
            return Err(BlockError::InvalidSnapContext(self.image_name.to_string()));
        }
        Ok(snapc)
    }

    /// The image's current snapshot context
    pub async fn current_context(&self) -> BlockResult<SnapContext> {
        let (seq, snaps) = self.list().await?;
        self.context_from(seq, &snaps)
    }

    /// Snapshot context plus the id of the first snapshot named `name`
    pub async fn context_for(&self, name: &str) -> BlockResult<(SnapContext, SnapId)> {
        let (seq, snaps) = self.list().await?;
        let snapc = self.context_from(seq, &snaps)?;
        let id = snaps
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.id)
            .ok_or_else(|| {
                BlockError::SnapshotNotFound(format!("{}@{name}", self.image_name))
            })?;
        Ok((snapc, id))
    }

    /// Allocate a snapshot id and record it under `name`
    ///
    /// The image's current context is checked first, so a missing image or
    /// a corrupt snapshot table fails before an id is allocated.
    pub async fn create(&self, name: &str) -> BlockResult<SnapId> {
        let snapc = self.current_context().await?;
        self.session.data().set_snap_context(&snapc)?;

        let md = self.session.md();
        let id = md.snap_create().await?;

        let mut input = Encoder::new();
        input.put_str(name).put_u64(id);
        if let Err(e) = md
            .exec(&self.header_oid, CLASS_NAME, METHOD_SNAP_ADD, input.finish())
            .await
        {
            // The allocated id stays allocated in the pool.
            warn!(image = self.image_name, snap = name, id, error = %e, "recording snapshot failed");
            return Err(self.image_error(e));
        }
        info!(image = self.image_name, snap = name, id, "created snapshot");

        self.session.notify_header_change(&self.header_oid, None).await;
        Ok(id)
    }

    /// Drop the first snapshot named `name` and release its id
    pub async fn remove(&self, name: &str) -> BlockResult<()> {
        let (_, id) = self.context_for(name).await?;

        let mut input = Encoder::new();
        input.put_str(name);
        self.session
            .md()
            .exec(&self.header_oid, CLASS_NAME, METHOD_SNAP_REMOVE, input.finish())
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    BlockError::SnapshotNotFound(format!("{}@{name}", self.image_name))
                } else {
                    e.into()
                }
            })?;
        self.session.data().snap_remove(id).await?;
        info!(image = self.image_name, snap = name, id, "removed snapshot");
        Ok(())
    }

    /// Restore every block of `header` to its state at snapshot `name`
    ///
    /// Blocks that do not exist are skipped.
    pub async fn rollback(&self, name: &str, header: &ImageHeader) -> BlockResult<()> {
        let (snapc, target) = self.context_for(name).await?;
        let mapper = BlockMapper::new(header)?;
        let count = mapper.block_count(header.image_size);
        let data = self.session.data();
        let snapc = &snapc;
        let mapper = &mapper;

        for_each_block(0..count, self.concurrency, |index| async move {
            let oid = mapper.object_name(index);
            tolerate_not_found(data.snap_rollback_object(&oid, snapc, target).await)
        })
        .await?;

        debug!(image = self.image_name, snap = name, blocks = count, "rolled back blocks");
        info!(image = self.image_name, snap = name, target, "rolled back to snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cls::RbdClass;
    use rbdio_client::{FaultOp, MemStore};
    use rbdio_common::Error;
    use std::sync::Arc;

    async fn setup() -> (Arc<MemStore>, PoolSession) {
        let store = Arc::new(MemStore::new().with_pool("rbd").with_class(Arc::new(RbdClass)));
        let session = PoolSession::open(store.clone(), "rbd").await.unwrap();
        let header = ImageHeader::create(4096, 12, 1, 22);
        session
            .md()
            .write("foo.rbd", 0, header.encode())
            .await
            .unwrap();
        (store, session)
    }

    fn manager(session: &PoolSession) -> SnapshotManager<'_> {
        SnapshotManager::new(session, "foo", "foo.rbd".to_string(), 1)
    }

    #[tokio::test]
    async fn test_create_list_remove() {
        let (store, session) = setup().await;
        let snaps = manager(&session);

        let a = snaps.create("a").await.unwrap();
        let b = snaps.create("b").await.unwrap();
        assert!(b > a);

        let (seq, listed) = snaps.list().await.unwrap();
        assert_eq!(seq, b);
        assert_eq!(
            listed,
            vec![
                SnapshotInfo { id: a, name: "a".into(), size: 4096 },
                SnapshotInfo { id: b, name: "b".into(), size: 4096 },
            ]
        );
        assert_eq!(store.notifications().len(), 2);

        let snapc = snaps.current_context().await.unwrap();
        assert_eq!(snapc.seq, b);
        assert_eq!(snapc.snaps, vec![a, b]);

        snaps.remove("a").await.unwrap();
        let (seq, listed) = snaps.list().await.unwrap();
        assert_eq!(seq, b);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "b");
    }

    #[tokio::test]
    async fn test_duplicate_names_resolve_to_first() {
        let (_store, session) = setup().await;
        let snaps = manager(&session);
        let first = snaps.create("dup").await.unwrap();
        snaps.create("dup").await.unwrap();

        let (_, id) = snaps.context_for("dup").await.unwrap();
        assert_eq!(id, first);
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let (_store, session) = setup().await;
        let snaps = manager(&session);
        let err = snaps.context_for("nope").await.unwrap_err();
        assert!(matches!(err, BlockError::SnapshotNotFound(_)));
        let err = snaps.remove("nope").await.unwrap_err();
        assert!(matches!(err, BlockError::SnapshotNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_image() {
        let (_store, session) = setup().await;
        let snaps = SnapshotManager::new(&session, "ghost", "ghost.rbd".to_string(), 1);
        assert!(matches!(
            snaps.list().await.unwrap_err(),
            BlockError::ImageNotFound(_)
        ));
        assert!(matches!(
            snaps.create("s").await.unwrap_err(),
            BlockError::ImageNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_record_failure_leaks_id() {
        let (store, session) = setup().await;
        // A header whose sequence is ahead of the pool allocator makes
        // snap_add reject the freshly allocated id.
        let mut header = ImageHeader::create(4096, 12, 1, 22);
        header.snapshot_sequence = 100;
        session
            .md()
            .write("foo.rbd", 0, header.encode())
            .await
            .unwrap();
        let snaps = manager(&session);

        let err = snaps.create("s").await.unwrap_err();
        assert!(matches!(err, BlockError::Store(Error::InvalidArgument(_))));
        assert!(store.notifications().is_empty());
        assert!(snaps.list().await.unwrap().1.is_empty());
        // Id 1 stays allocated; nothing released it.
        assert_eq!(session.md().snap_create().await.unwrap(), 2);
        session.data().snap_remove(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_header_allocates_nothing() {
        let (_store, session) = setup().await;
        session
            .md()
            .write("bad.rbd", 0, Bytes::from_static(b"short"))
            .await
            .unwrap();
        let snaps = SnapshotManager::new(&session, "bad", "bad.rbd".to_string(), 1);
        assert!(snaps.create("s").await.is_err());
        assert_eq!(session.md().snap_create().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_sets_data_context() {
        let (store, session) = setup().await;
        let snaps = manager(&session);
        let first = snaps.create("a").await.unwrap();
        snaps.create("b").await.unwrap();

        // The data handle now carries [first]; a write preserves a clone
        // that rollback to `a` can restore.
        session
            .data()
            .write("blk", 0, Bytes::from_static(b"x"))
            .await
            .unwrap();
        session
            .data()
            .snap_rollback_object("blk", &SnapContext::new(first, vec![first]), first)
            .await
            .unwrap();
        assert!(store.object_data("rbd", "blk").is_none());
    }

    #[tokio::test]
    async fn test_failed_id_release_is_not_retried() {
        let (store, session) = setup().await;
        let snaps = manager(&session);
        snaps.create("a").await.unwrap();
        snaps.create("b").await.unwrap();

        store.fail_next(FaultOp::SnapRemove, None, Error::Timeout);
        let err = snaps.remove("a").await.unwrap_err();
        assert!(matches!(err, BlockError::Store(Error::Timeout)));

        // The name binding went first and stays gone.
        let (_, listed) = snaps.list().await.unwrap();
        assert_eq!(listed.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert!(matches!(
            snaps.remove("a").await.unwrap_err(),
            BlockError::SnapshotNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_corrupt_listing() {
        let (_store, session) = setup().await;
        session
            .md()
            .write("bad.rbd", 0, Bytes::from_static(b"short"))
            .await
            .unwrap();
        let snaps = SnapshotManager::new(&session, "bad", "bad.rbd".to_string(), 1);
        assert!(matches!(
            snaps.list().await.unwrap_err(),
            BlockError::Store(Error::Decode(_))
        ));
    }

    #[test]
    fn test_decode_truncated_listing() {
        let mut enc = Encoder::new();
        enc.put_u64(4).put_u32(2).put_u64(4).put_u64(4096);
        assert!(decode_snap_list(&enc.finish()).is_err());
    }
}
