//! Bulk per-block operations
//!
//! Trim, rollback and copy touch every block of an image. Blocks are
//! processed with at most `concurrency` requests in flight; a concurrency of
//! one is strictly sequential. The first error stops the walk, leaving the
//! blocks already processed as they are.

use crate::error::{BlockError, BlockResult};
use crate::mapper::BlockIndex;
use futures::stream::{self, TryStreamExt};
use std::future::Future;
use std::ops::Range;

/// Run `op` for every block index in `blocks`
pub async fn for_each_block<F, Fut>(
    blocks: Range<BlockIndex>,
    concurrency: usize,
    op: F,
) -> BlockResult<()>
where
    F: FnMut(BlockIndex) -> Fut,
    Fut: Future<Output = BlockResult<()>>,
{
    stream::iter(blocks.map(Ok::<BlockIndex, BlockError>))
        .try_for_each_concurrent(concurrency.max(1), op)
        .await
}

/// Treat an absent object as success
pub fn tolerate_not_found(result: rbdio_common::Result<()>) -> BlockResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other.map_err(BlockError::from),
    }
}
