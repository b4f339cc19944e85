//! Block-name id allocation
//!
//! Every image gets a pool-unique numeric id from a counter kept in the
//! pool's info object. The id only feeds the block name prefix; ids are
//! never reused.

use crate::cls::{CLASS_NAME, METHOD_ASSIGN_BID};
use crate::error::{BlockResult, FormatError};
use bytes::Bytes;
use rbdio_client::Pool;
use rbdio_common::Decoder;
use tracing::debug;

/// Allocate the next block-name id from `info_oid`
///
/// The info object is created empty first if it does not exist.
pub async fn assign_bid(md: &Pool, info_oid: &str) -> BlockResult<u64> {
    // Touch: a zero-length write creates the object and leaves data alone.
    md.write(info_oid, 0, Bytes::new()).await?;

    let out = md
        .exec(info_oid, CLASS_NAME, METHOD_ASSIGN_BID, Bytes::new())
        .await?;
    let id = Decoder::new(&out)
        .get_u64()
        .map_err(|e| FormatError::Payload(format!("assign_bid: {e}")))?;
    debug!(pool = md.name(), id, "assigned block name id");
    Ok(id)
}
