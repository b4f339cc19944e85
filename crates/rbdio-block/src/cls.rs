//! Server-side `rbd` object class
//!
//! Procedures that run inside the object store against a single object:
//!
//! - `assign_bid` on the info object: bump and return the block-name counter
//! - `snap_add`, `snap_remove`, `snap_list` on a header object: maintain the
//!   inline snapshot table that follows the fixed header
//!
//! Register it with a store that supports object classes, e.g.
//! `MemStore::new().with_class(Arc::new(RbdClass))`.

use crate::header::{
    ImageHeader, InlineSnapshot, decode_snapshot_table, encode_with_snapshot_table,
};
use bytes::Bytes;
use rbdio_client::{ClassContext, ObjectClass};
use rbdio_common::{Decoder, Encoder, Error, Result};
use tracing::debug;

/// Class name used in `exec` calls
pub const CLASS_NAME: &str = "rbd";

pub const METHOD_ASSIGN_BID: &str = "assign_bid";
pub const METHOD_SNAP_ADD: &str = "snap_add";
pub const METHOD_SNAP_REMOVE: &str = "snap_remove";
pub const METHOD_SNAP_LIST: &str = "snap_list";

/// The `rbd` object class
#[derive(Debug, Default, Clone, Copy)]
pub struct RbdClass;

impl ObjectClass for RbdClass {
    fn name(&self) -> &str {
        CLASS_NAME
    }

    fn call(&self, method: &str, ctx: &mut ClassContext<'_>, input: &[u8]) -> Result<Bytes> {
        match method {
            METHOD_ASSIGN_BID => assign_bid(ctx),
            METHOD_SNAP_ADD => snap_add(ctx, input),
            METHOD_SNAP_REMOVE => snap_remove(ctx, input),
            METHOD_SNAP_LIST => snap_list(ctx),
            _ => Err(Error::MethodNotFound {
                class: CLASS_NAME.to_string(),
                method: method.to_string(),
            }),
        }
    }
}

fn assign_bid(ctx: &mut ClassContext<'_>) -> Result<Bytes> {
    let data = ctx.read()?;
    let max_id = match data.get(..8) {
        Some(raw) => {
            let mut le = [0u8; 8];
            le.copy_from_slice(raw);
            u64::from_le_bytes(le)
        }
        None => 0,
    };
    let id = max_id + 1;
    ctx.write_full(id.to_le_bytes().to_vec());

    let mut out = Encoder::new();
    out.put_u64(id);
    Ok(out.finish())
}

fn load_header(ctx: &ClassContext<'_>) -> Result<(ImageHeader, Vec<InlineSnapshot>)> {
    let data = ctx.read()?;
    let header = ImageHeader::decode(data).map_err(|e| Error::decode(e.to_string()))?;
    let snaps = decode_snapshot_table(data, &header).map_err(|e| Error::decode(e.to_string()))?;
    Ok((header, snaps))
}

fn snap_add(ctx: &mut ClassContext<'_>, input: &[u8]) -> Result<Bytes> {
    let mut dec = Decoder::new(input);
    let name = dec.get_string()?;
    let id = dec.get_u64()?;

    let (mut header, mut snaps) = load_header(ctx)?;
    if id <= header.snapshot_sequence {
        return Err(Error::invalid_argument(format!(
            "stale snapshot id {id} (sequence {})",
            header.snapshot_sequence
        )));
    }
    debug!(oid = ctx.oid(), %name, id, "adding snapshot");
    snaps.push(InlineSnapshot {
        id,
        image_size: header.image_size,
        name,
    });
    header.snapshot_sequence = id;
    ctx.write_full(encode_with_snapshot_table(&header, &snaps).to_vec());
    Ok(Bytes::new())
}

fn snap_remove(ctx: &mut ClassContext<'_>, input: &[u8]) -> Result<Bytes> {
    let name = Decoder::new(input).get_string()?;

    let (header, mut snaps) = load_header(ctx)?;
    let pos = snaps
        .iter()
        .position(|s| s.name == name)
        .ok_or_else(|| Error::not_found(ctx.pool(), format!("{}@{name}", ctx.oid())))?;
    let removed = snaps.remove(pos);
    debug!(oid = ctx.oid(), %name, id = removed.id, "removing snapshot");
    ctx.write_full(encode_with_snapshot_table(&header, &snaps).to_vec());
    Ok(Bytes::new())
}

fn snap_list(ctx: &ClassContext<'_>) -> Result<Bytes> {
    let (header, snaps) = load_header(ctx)?;
    let mut out = Encoder::new();
    out.put_u64(header.snapshot_sequence);
    out.put_u32(u32::try_from(snaps.len()).unwrap_or(u32::MAX));
    for snap in &snaps {
        out.put_u64(snap.id).put_u64(snap.image_size).put_str(&snap.name);
    }
    Ok(out.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_ctx(data: Vec<u8>) -> ClassContext<'static> {
        ClassContext::new("rbd", "foo.rbd", Some(data))
    }

    fn add_input(name: &str, id: u64) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_str(name).put_u64(id);
        enc.finish().to_vec()
    }

    #[test]
    fn test_assign_bid_counts_up() {
        let mut ctx = ClassContext::new("rbd", "rbd_info", Some(Vec::new()));
        let out = RbdClass.call(METHOD_ASSIGN_BID, &mut ctx, &[]).unwrap();
        assert_eq!(Decoder::new(&out).get_u64().unwrap(), 1);

        let mut ctx = ClassContext::new("rbd", "rbd_info", ctx.into_update());
        let out = RbdClass.call(METHOD_ASSIGN_BID, &mut ctx, &[]).unwrap();
        assert_eq!(Decoder::new(&out).get_u64().unwrap(), 2);
    }

    #[test]
    fn test_assign_bid_requires_object() {
        let mut ctx = ClassContext::new("rbd", "rbd_info", None);
        let err = RbdClass.call(METHOD_ASSIGN_BID, &mut ctx, &[]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_snap_add_list_remove() {
        let header = ImageHeader::create(4096, 0, 1, 22);
        let mut ctx = header_ctx(header.encode().to_vec());
        RbdClass
            .call(METHOD_SNAP_ADD, &mut ctx, &add_input("s1", 3))
            .unwrap();
        let data = ctx.into_update().unwrap();

        let stored = ImageHeader::decode(&data).unwrap();
        assert_eq!(stored.snapshot_sequence, 3);
        assert_eq!(stored.snapshot_count, 1);

        let mut ctx = header_ctx(data);
        let out = RbdClass.call(METHOD_SNAP_LIST, &mut ctx, &[]).unwrap();
        let mut dec = Decoder::new(&out);
        assert_eq!(dec.get_u64().unwrap(), 3);
        assert_eq!(dec.get_u32().unwrap(), 1);
        assert_eq!(dec.get_u64().unwrap(), 3);
        assert_eq!(dec.get_u64().unwrap(), 4096);
        assert_eq!(dec.get_string().unwrap(), "s1");

        let mut enc = Encoder::new();
        enc.put_str("s1");
        RbdClass
            .call(METHOD_SNAP_REMOVE, &mut ctx, &enc.finish())
            .unwrap();
        let stored = ImageHeader::decode(&ctx.into_update().unwrap()).unwrap();
        assert_eq!(stored.snapshot_count, 0);
        assert_eq!(stored.snapshot_sequence, 3);
    }

    #[test]
    fn test_snap_add_rejects_stale_id() {
        let header = ImageHeader::create(4096, 0, 1, 22);
        let mut ctx = header_ctx(header.encode().to_vec());
        RbdClass
            .call(METHOD_SNAP_ADD, &mut ctx, &add_input("s1", 5))
            .unwrap();
        let mut ctx = header_ctx(ctx.into_update().unwrap());
        let err = RbdClass
            .call(METHOD_SNAP_ADD, &mut ctx, &add_input("s2", 5))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_snap_remove_missing() {
        let header = ImageHeader::create(4096, 0, 1, 22);
        let mut ctx = header_ctx(header.encode().to_vec());
        let mut enc = Encoder::new();
        enc.put_str("nope");
        let err = RbdClass
            .call(METHOD_SNAP_REMOVE, &mut ctx, &enc.finish())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unknown_method() {
        let mut ctx = header_ctx(Vec::new());
        let err = RbdClass.call("frobnicate", &mut ctx, &[]).unwrap_err();
        assert!(matches!(err, Error::MethodNotFound { .. }));
    }

    #[test]
    fn test_truncated_header() {
        let mut ctx = header_ctx(vec![0u8; 10]);
        let err = RbdClass.call(METHOD_SNAP_LIST, &mut ctx, &[]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
