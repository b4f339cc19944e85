//! Image directory
//!
//! One TMAP object per pool maps every image name to an empty value. Edits
//! are single-key upserts and removals submitted to the store, never a
//! client-side rewrite of the whole map.

use crate::error::{BlockResult, FormatError};
use bytes::Bytes;
use rbdio_client::{Pool, Tmap, TmapEdit};
use tracing::debug;

/// Pool-wide image directory
#[derive(Debug)]
pub struct Directory<'a> {
    md: &'a Pool,
    oid: &'a str,
}

impl<'a> Directory<'a> {
    #[must_use]
    pub const fn new(md: &'a Pool, oid: &'a str) -> Self {
        Self { md, oid }
    }

    /// Add `image_name`. Adding a present name is a no-op.
    pub async fn add(&self, image_name: &str) -> BlockResult<()> {
        let edit = TmapEdit::encode_all(&[TmapEdit::Set(image_name.to_string(), Bytes::new())]);
        self.md.tmap_update(self.oid, edit).await?;
        debug!(image = image_name, "added directory entry");
        Ok(())
    }

    /// Remove `image_name`. Removing an absent name is not an error.
    pub async fn remove(&self, image_name: &str) -> BlockResult<()> {
        let edit = TmapEdit::encode_all(&[TmapEdit::Remove(image_name.to_string())]);
        match self.md.tmap_update(self.oid, edit).await {
            Ok(()) => {
                debug!(image = image_name, "removed directory entry");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(image = image_name, "directory entry already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Image names in directory order. A missing directory lists nothing.
    pub async fn list(&self) -> BlockResult<Vec<String>> {
        let raw = match self.md.read(self.oid, 0, 0).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let map = Tmap::decode(&raw).map_err(|e| FormatError::Payload(format!("directory: {e}")))?;
        Ok(map.entries.into_keys().collect())
    }
}
