//! Block mapping for images
//!
//! Maps logical byte offsets of an image to the block objects backing it.

use crate::error::FormatError;
use crate::header::ImageHeader;

/// Block index within an image
pub type BlockIndex = u64;

/// A range of bytes within a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    /// Block index
    pub index: BlockIndex,
    /// Byte offset within the block
    pub offset_in_block: u64,
    /// Number of bytes in this range
    pub length: u64,
}

/// Maps image offsets to block objects
///
/// Images are divided into `1 << order` byte blocks. Each block is stored as
/// one object named after the image's block name prefix.
///
/// ```text
/// Image (10MB, order 22)
/// ├── Block 0:  bytes 0 - 4MB       → rb.0.1.000000000000
/// ├── Block 1:  bytes 4MB - 8MB     → rb.0.1.000000000001
/// └── Block 2:  bytes 8MB - 10MB    → rb.0.1.000000000002
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMapper {
    order: u8,
    prefix: String,
}

impl BlockMapper {
    /// Mapper for an image header
    pub fn new(header: &ImageHeader) -> Result<Self, FormatError> {
        if header.block_order >= 64 {
            return Err(FormatError::InvalidOrder(header.block_order));
        }
        Ok(Self {
            order: header.block_order,
            prefix: header.block_name_prefix.clone(),
        })
    }

    #[must_use]
    pub const fn order(&self) -> u8 {
        self.order
    }

    /// Block size in bytes
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        1 << self.order
    }

    /// Number of blocks covering `image_size` bytes
    #[must_use]
    pub const fn block_count(&self, image_size: u64) -> u64 {
        image_size.div_ceil(self.block_size())
    }

    /// Block holding byte `offset`
    #[must_use]
    pub const fn block_index(&self, offset: u64) -> BlockIndex {
        offset >> self.order
    }

    /// Object name of block `index`
    #[must_use]
    pub fn object_name(&self, index: BlockIndex) -> String {
        format!("{}.{:012x}", self.prefix, index)
    }

    /// Convert a byte range to block ranges
    ///
    /// Returns a list of block ranges that cover the specified byte range.
    /// Handles ranges that span multiple blocks.
    #[must_use]
    pub fn byte_range_to_blocks(&self, start_byte: u64, length: u64) -> Vec<BlockRange> {
        if length == 0 {
            return Vec::new();
        }

        let block_size = self.block_size();
        let end_byte = start_byte.saturating_add(length);
        let start_block = self.block_index(start_byte);
        let end_block = self.block_index(end_byte - 1);

        // Grown on demand: the block count comes from caller-supplied lengths.
        let mut ranges = Vec::new();
        for index in start_block..=end_block {
            let block_start = index * block_size;
            let block_end = block_start.saturating_add(block_size);

            // Intersection of [start_byte, end_byte) and [block_start, block_end)
            let range_start = start_byte.max(block_start);
            let range_end = end_byte.min(block_end);

            ranges.push(BlockRange {
                index,
                offset_in_block: range_start - block_start,
                length: range_end - range_start,
            });
        }

        ranges
    }
}
