//! In-memory object store
//!
//! A complete [`ObjectStore`] kept in process memory. It models what the
//! block layer depends on:
//!
//! - per-object versions and version-asserted writes
//! - sparse extents
//! - self-managed snapshots with clone-on-write under a handle's snapshot
//!   context, and per-object rollback
//! - TMAP objects and registered object classes
//!
//! Tests can queue one-shot faults to exercise partial-failure paths.

use crate::class::{ClassContext, ObjectClass};
use crate::store::ObjectStore;
use crate::tmap::{Tmap, TmapEdit};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rbdio_common::{
    Error, ObjectStat, PoolId, Result, SnapContext, SnapId, SparseRead, Version,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Operation kinds a fault can be attached to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Read,
    SparseRead,
    Write,
    Remove,
    Stat,
    Exec,
    TmapUpdate,
    SnapCreate,
    SnapRemove,
    Rollback,
    Notify,
}

/// A recorded change notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub pool: String,
    pub oid: String,
    pub version: Version,
}

#[derive(Clone, Debug)]
struct Fault {
    op: FaultOp,
    oid: Option<String>,
    error: Error,
}

/// Live contents of an object
#[derive(Clone, Debug, Default)]
struct Head {
    data: Vec<u8>,
    /// Written ranges (offset -> length), merged
    extents: BTreeMap<u64, u64>,
}

impl Head {
    fn write(&mut self, offset: u64, data: &[u8]) {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(data.len());
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        insert_extent(&mut self.extents, offset, data.len() as u64);
    }

    fn replace(data: Vec<u8>) -> Self {
        let mut extents = BTreeMap::new();
        insert_extent(&mut extents, 0, data.len() as u64);
        Self { data, extents }
    }
}

/// Preserved contents for a set of snapshots
#[derive(Clone, Debug)]
struct SnapClone {
    snaps: Vec<SnapId>,
    head: Option<Head>,
}

#[derive(Debug, Default)]
struct MemObject {
    head: Option<Head>,
    version: Version,
    /// Snapshot sequence the object was last made writeable under
    snap_seq: SnapId,
    clones: Vec<SnapClone>,
}

impl MemObject {
    /// Preserve the current head for snapshots newer than the last write
    fn make_writeable(&mut self, snapc: &SnapContext, removed: &BTreeSet<SnapId>) {
        if snapc.seq <= self.snap_seq {
            return;
        }
        let newer: Vec<SnapId> = snapc
            .snaps
            .iter()
            .copied()
            .filter(|s| *s > self.snap_seq && !removed.contains(s))
            .collect();
        if !newer.is_empty() {
            self.clones.push(SnapClone {
                snaps: newer,
                head: self.head.clone(),
            });
        }
        self.snap_seq = snapc.seq;
    }

    fn is_garbage(&self) -> bool {
        self.head.is_none() && self.clones.is_empty()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    objects: BTreeMap<String, MemObject>,
    version: Version,
    snap_seq: SnapId,
    removed_snaps: BTreeSet<SnapId>,
}

impl PoolState {
    fn next_version(&mut self) -> Version {
        self.version += 1;
        self.version
    }
}

#[derive(Debug)]
struct Handle {
    pool: String,
    snapc: SnapContext,
    last_version: Version,
}

#[derive(Debug, Default)]
struct MemState {
    pools: HashMap<String, PoolState>,
    handles: HashMap<PoolId, Handle>,
    next_handle: u64,
    faults: Vec<Fault>,
    notifications: Vec<Notification>,
}

impl MemState {
    fn take_fault(&mut self, op: FaultOp, oid: &str) -> Option<Error> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.op == op && f.oid.as_deref().is_none_or(|o| o == oid))?;
        Some(self.faults.remove(idx).error)
    }

    /// Resolve a handle to its state and pool
    fn resolve(&mut self, id: PoolId) -> Result<(&mut Handle, &mut PoolState)> {
        let handle = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| Error::invalid_argument(format!("unknown pool handle {id}")))?;
        let pool = self
            .pools
            .get_mut(&handle.pool)
            .ok_or_else(|| Error::PoolNotFound(handle.pool.clone()))?;
        Ok((handle, pool))
    }
}

/// In-memory object store
#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
    classes: HashMap<String, Arc<dyn ObjectClass>>,
}

impl MemStore {
    /// Create an empty store with no pools
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a pool
    #[must_use]
    pub fn with_pool(self, name: &str) -> Self {
        self.create_pool(name);
        self
    }

    /// Builder: register an object class
    #[must_use]
    pub fn with_class(mut self, class: Arc<dyn ObjectClass>) -> Self {
        self.classes.insert(class.name().to_string(), class);
        self
    }

    /// Create a pool if it does not exist
    pub fn create_pool(&self, name: &str) {
        self.state.lock().pools.entry(name.to_string()).or_default();
    }

    /// Queue a one-shot fault for the next matching operation
    ///
    /// With `oid == None` the fault matches any object.
    pub fn fail_next(&self, op: FaultOp, oid: Option<&str>, error: Error) {
        self.state.lock().faults.push(Fault {
            op,
            oid: oid.map(str::to_string),
            error,
        });
    }

    /// Names of objects with live contents, in order
    #[must_use]
    pub fn object_names(&self, pool: &str) -> Vec<String> {
        self.state
            .lock()
            .pools
            .get(pool)
            .map(|p| {
                p.objects
                    .iter()
                    .filter(|(_, o)| o.head.is_some())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live contents of an object
    #[must_use]
    pub fn object_data(&self, pool: &str, oid: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .pools
            .get(pool)
            .and_then(|p| p.objects.get(oid))
            .and_then(|o| o.head.as_ref())
            .map(|h| h.data.clone())
    }

    /// Notifications broadcast so far
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.clone()
    }

    /// Number of pool handles currently open
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    fn check_fault(&self, op: FaultOp, oid: &str) -> Result<()> {
        match self.state.lock().take_fault(op, oid) {
            Some(err) => {
                debug!(?op, oid, %err, "injected fault");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    fn name(&self) -> &str {
        "mem"
    }

    async fn open_pool(&self, pool: &str) -> Result<PoolId> {
        let mut st = self.state.lock();
        if !st.pools.contains_key(pool) {
            return Err(Error::PoolNotFound(pool.to_string()));
        }
        st.next_handle += 1;
        let id = PoolId::from_raw(st.next_handle);
        st.handles.insert(
            id,
            Handle {
                pool: pool.to_string(),
                snapc: SnapContext::default(),
                last_version: 0,
            },
        );
        Ok(id)
    }

    fn close_pool(&self, pool: PoolId) {
        self.state.lock().handles.remove(&pool);
    }

    fn set_snap_context(&self, pool: PoolId, snapc: &SnapContext) -> Result<()> {
        if !snapc.is_valid() {
            return Err(Error::invalid_argument(format!(
                "invalid snapshot context {snapc:?}"
            )));
        }
        let mut st = self.state.lock();
        let (handle, _) = st.resolve(pool)?;
        handle.snapc = snapc.clone();
        Ok(())
    }

    fn get_last_version(&self, pool: PoolId) -> Result<Version> {
        let mut st = self.state.lock();
        let (handle, _) = st.resolve(pool)?;
        Ok(handle.last_version)
    }

    async fn read(&self, pool: PoolId, oid: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.check_fault(FaultOp::Read, oid)?;
        let mut st = self.state.lock();
        let (handle, state) = st.resolve(pool)?;
        let obj = state
            .objects
            .get(oid)
            .filter(|o| o.head.is_some())
            .ok_or_else(|| Error::not_found(&handle.pool, oid))?;
        handle.last_version = obj.version;
        let data = obj.head.as_ref().map_or(&[][..], |h| &h.data[..]);
        let size = data.len() as u64;
        let start = offset.min(size);
        let end = if len == 0 {
            size
        } else {
            offset.saturating_add(len).min(size)
        };
        Ok(Bytes::copy_from_slice(&data[start as usize..end as usize]))
    }

    async fn sparse_read(
        &self,
        pool: PoolId,
        oid: &str,
        offset: u64,
        len: u64,
    ) -> Result<SparseRead> {
        self.check_fault(FaultOp::SparseRead, oid)?;
        let mut st = self.state.lock();
        let (handle, state) = st.resolve(pool)?;
        let head = state
            .objects
            .get(oid)
            .and_then(|o| {
                handle.last_version = o.version;
                o.head.as_ref()
            })
            .ok_or_else(|| Error::not_found(&handle.pool, oid))?;
        let end = if len == 0 {
            head.data.len() as u64
        } else {
            offset.saturating_add(len)
        };
        let mut out = SparseRead::default();
        let mut data = Vec::new();
        for (&start, &length) in &head.extents {
            let s = start.max(offset);
            let e = (start + length).min(end);
            if s < e {
                out.extents.insert(s, e - s);
                data.extend_from_slice(&head.data[s as usize..e as usize]);
            }
        }
        out.data = Bytes::from(data);
        Ok(out)
    }

    async fn write(
        &self,
        pool: PoolId,
        oid: &str,
        offset: u64,
        data: Bytes,
        assert_version: Option<Version>,
    ) -> Result<()> {
        self.check_fault(FaultOp::Write, oid)?;
        let mut st = self.state.lock();
        let (handle, state) = st.resolve(pool)?;
        let actual = state.objects.get(oid).map_or(0, |o| o.version);
        if let Some(expected) = assert_version
            && expected != actual
        {
            return Err(Error::VersionConflict {
                oid: oid.to_string(),
                expected,
                actual,
            });
        }
        let version = state.next_version();
        let removed = state.removed_snaps.clone();
        let obj = state.objects.entry(oid.to_string()).or_default();
        obj.make_writeable(&handle.snapc, &removed);
        obj.head.get_or_insert_with(Head::default).write(offset, &data);
        obj.version = version;
        handle.last_version = version;
        Ok(())
    }

    async fn remove(&self, pool: PoolId, oid: &str) -> Result<()> {
        self.check_fault(FaultOp::Remove, oid)?;
        let mut st = self.state.lock();
        let (handle, state) = st.resolve(pool)?;
        let removed = state.removed_snaps.clone();
        let version = state.next_version();
        let obj = state
            .objects
            .get_mut(oid)
            .filter(|o| o.head.is_some())
            .ok_or_else(|| Error::not_found(&handle.pool, oid))?;
        obj.make_writeable(&handle.snapc, &removed);
        obj.head = None;
        obj.version = version;
        handle.last_version = version;
        if obj.is_garbage() {
            state.objects.remove(oid);
        }
        Ok(())
    }

    async fn stat(&self, pool: PoolId, oid: &str) -> Result<ObjectStat> {
        self.check_fault(FaultOp::Stat, oid)?;
        let mut st = self.state.lock();
        let (handle, state) = st.resolve(pool)?;
        let obj = state
            .objects
            .get(oid)
            .filter(|o| o.head.is_some())
            .ok_or_else(|| Error::not_found(&handle.pool, oid))?;
        handle.last_version = obj.version;
        Ok(ObjectStat {
            size: obj.head.as_ref().map_or(0, |h| h.data.len() as u64),
            version: obj.version,
        })
    }

    async fn exec(
        &self,
        pool: PoolId,
        oid: &str,
        class: &str,
        method: &str,
        input: Bytes,
    ) -> Result<Bytes> {
        self.check_fault(FaultOp::Exec, oid)?;
        let cls = self
            .classes
            .get(class)
            .cloned()
            .ok_or_else(|| Error::ClassNotFound(class.to_string()))?;
        let mut st = self.state.lock();
        let (handle, state) = st.resolve(pool)?;
        let current = state
            .objects
            .get(oid)
            .and_then(|o| o.head.as_ref())
            .map(|h| h.data.clone());
        let pool_name = handle.pool.clone();
        let mut ctx = ClassContext::new(&pool_name, oid, current);
        let output = cls.call(method, &mut ctx, &input)?;
        if let Some(data) = ctx.into_update() {
            let version = state.next_version();
            let removed = state.removed_snaps.clone();
            let obj = state.objects.entry(oid.to_string()).or_default();
            obj.make_writeable(&handle.snapc, &removed);
            obj.head = Some(Head::replace(data));
            obj.version = version;
        }
        handle.last_version = state.objects.get(oid).map_or(0, |o| o.version);
        Ok(output)
    }

    async fn tmap_update(&self, pool: PoolId, oid: &str, edit: Bytes) -> Result<()> {
        self.check_fault(FaultOp::TmapUpdate, oid)?;
        let edits = TmapEdit::decode_all(&edit)?;
        let mut st = self.state.lock();
        let (handle, state) = st.resolve(pool)?;
        let mut map = match state.objects.get(oid).and_then(|o| o.head.as_ref()) {
            Some(head) => Tmap::decode(&head.data)?,
            None => Tmap::default(),
        };
        map.apply(edits, &handle.pool, oid)?;
        let version = state.next_version();
        let removed = state.removed_snaps.clone();
        let obj = state.objects.entry(oid.to_string()).or_default();
        obj.make_writeable(&handle.snapc, &removed);
        obj.head = Some(Head::replace(map.encode().to_vec()));
        obj.version = version;
        handle.last_version = version;
        Ok(())
    }

    async fn selfmanaged_snap_create(&self, pool: PoolId) -> Result<SnapId> {
        self.check_fault(FaultOp::SnapCreate, "")?;
        let mut st = self.state.lock();
        let (_, state) = st.resolve(pool)?;
        state.snap_seq += 1;
        Ok(state.snap_seq)
    }

    async fn selfmanaged_snap_remove(&self, pool: PoolId, snap: SnapId) -> Result<()> {
        self.check_fault(FaultOp::SnapRemove, "")?;
        let mut st = self.state.lock();
        let (_, state) = st.resolve(pool)?;
        if snap == 0 || snap > state.snap_seq {
            return Err(Error::SnapshotIdNotFound(snap));
        }
        if !state.removed_snaps.insert(snap) {
            return Ok(());
        }
        for obj in state.objects.values_mut() {
            for clone in &mut obj.clones {
                clone.snaps.retain(|s| *s != snap);
            }
            obj.clones.retain(|c| !c.snaps.is_empty());
        }
        state.objects.retain(|_, o| !o.is_garbage());
        Ok(())
    }

    async fn selfmanaged_snap_rollback_object(
        &self,
        pool: PoolId,
        oid: &str,
        snapc: &SnapContext,
        target: SnapId,
    ) -> Result<()> {
        self.check_fault(FaultOp::Rollback, oid)?;
        let mut st = self.state.lock();
        let (handle, state) = st.resolve(pool)?;
        let removed = state.removed_snaps.clone();
        let version = state.next_version();
        let obj = state
            .objects
            .get_mut(oid)
            .ok_or_else(|| Error::not_found(&handle.pool, oid))?;
        let preserved = obj
            .clones
            .iter()
            .find(|c| c.snaps.contains(&target))
            .map(|c| c.head.clone());
        obj.make_writeable(snapc, &removed);
        // No clone means the object is unchanged since the snapshot.
        if let Some(head) = preserved {
            obj.head = head;
        }
        obj.version = version;
        handle.last_version = version;
        if obj.is_garbage() {
            state.objects.remove(oid);
        }
        Ok(())
    }

    async fn notify(&self, pool: PoolId, oid: &str, version: Version) -> Result<()> {
        self.check_fault(FaultOp::Notify, oid)?;
        let mut st = self.state.lock();
        let pool_name = st.resolve(pool)?.0.pool.clone();
        st.notifications.push(Notification {
            pool: pool_name,
            oid: oid.to_string(),
            version,
        });
        Ok(())
    }
}

/// Insert `[offset, offset + len)`, merging overlapping and adjacent ranges
fn insert_extent(extents: &mut BTreeMap<u64, u64>, offset: u64, len: u64) {
    if len == 0 {
        return;
    }
    let mut start = offset;
    let mut end = offset + len;
    let touching: Vec<u64> = extents
        .range(..=end)
        .filter(|(s, l)| **s + **l >= start)
        .map(|(s, _)| *s)
        .collect();
    for s in touching {
        if let Some(l) = extents.remove(&s) {
            start = start.min(s);
            end = end.max(s + l);
        }
    }
    extents.insert(start, end - start);
}
