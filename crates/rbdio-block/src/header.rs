//! On-disk image header
//!
//! Header layout (112 bytes, little-endian):
//! ```text
//! +--------+------+---------------------------------------------+
//! | offset | size | field                                       |
//! +--------+------+---------------------------------------------+
//! |      0 |   40 | text tag "<<< Rados Block Device Image >>>\n" |
//! |     40 |   24 | block name prefix, NUL padded               |
//! |     64 |    4 | signature "RBD"                             |
//! |     68 |    8 | version "001.005"                           |
//! |     76 |    1 | block order                                 |
//! |     77 |    1 | crypt type                                  |
//! |     78 |    1 | compression type                            |
//! |     79 |    1 | unused                                      |
//! |     80 |    8 | image size                                  |
//! |     88 |    8 | snapshot sequence                           |
//! |     96 |    4 | snapshot count                              |
//! |    100 |    4 | reserved                                    |
//! |    104 |    8 | snapshot names length                       |
//! +--------+------+---------------------------------------------+
//! ```
//!
//! The header object may continue with an inline snapshot table:
//! `snapshot_count` pairs of `(id: u64, image_size: u64)` followed by
//! `snapshot_names_length` bytes of NUL-terminated names, in the same order.

use crate::error::FormatError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed header record
pub const HEADER_SIZE: usize = 112;

/// Text tag identifying the format
pub const HEADER_TEXT: &[u8] = b"<<< Rados Block Device Image >>>\n";
/// Format signature
pub const HEADER_SIGNATURE: &[u8] = b"RBD";
/// Format revision
pub const HEADER_VERSION: &[u8] = b"001.005";

const TEXT_LEN: usize = 40;
const BLOCK_NAME_LEN: usize = 24;
const SIGNATURE_LEN: usize = 4;
const VERSION_LEN: usize = 8;
const SNAP_ENTRY_SIZE: usize = 16;

/// Data encryption applied to block objects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptType {
    None,
    Unknown(u8),
}

impl From<u8> for CryptType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::None,
            other => Self::Unknown(other),
        }
    }
}

impl From<CryptType> for u8 {
    fn from(value: CryptType) -> Self {
        match value {
            CryptType::None => 0,
            CryptType::Unknown(v) => v,
        }
    }
}

/// Compression applied to block objects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompType {
    None,
    Unknown(u8),
}

impl From<u8> for CompType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::None,
            other => Self::Unknown(other),
        }
    }
}

impl From<CompType> for u8 {
    fn from(value: CompType) -> Self {
        match value {
            CompType::None => 0,
            CompType::Unknown(v) => v,
        }
    }
}

/// Decoded image header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub text_tag: [u8; TEXT_LEN],
    /// Prefix of every block object name of this image
    pub block_name_prefix: String,
    pub signature: [u8; SIGNATURE_LEN],
    pub version: [u8; VERSION_LEN],
    /// Block size is `1 << block_order`
    pub block_order: u8,
    pub crypt_type: CryptType,
    pub comp_type: CompType,
    /// Logical device size in bytes
    pub image_size: u64,
    /// Last snapshot id assigned to this image
    pub snapshot_sequence: u64,
    pub snapshot_count: u32,
    pub reserved: u32,
    pub snapshot_names_length: u64,
}

fn padded<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let n = src.len().min(N);
    out[..n].copy_from_slice(&src[..n]);
    out
}

/// Render the block name prefix for an allocated id
#[must_use]
pub fn block_name_prefix(allocated_id: u64) -> String {
    let hi = (allocated_id >> 32) as u32;
    let lo = (allocated_id & 0xFFFF_FFFF) as u32;
    format!("rb.{hi:x}.{lo:x}")
}

impl ImageHeader {
    /// Build the header of a new image
    ///
    /// A `requested_order` of zero selects `default_order`.
    #[must_use]
    pub fn create(image_size: u64, requested_order: u8, allocated_id: u64, default_order: u8) -> Self {
        let block_order = if requested_order == 0 {
            default_order
        } else {
            requested_order
        };
        Self {
            text_tag: padded(HEADER_TEXT),
            block_name_prefix: block_name_prefix(allocated_id),
            signature: padded(HEADER_SIGNATURE),
            version: padded(HEADER_VERSION),
            block_order,
            crypt_type: CryptType::None,
            comp_type: CompType::None,
            image_size,
            snapshot_sequence: 0,
            snapshot_count: 0,
            reserved: 0,
            snapshot_names_length: 0,
        }
    }

    /// Check the magic text, signature and version
    #[must_use]
    pub fn has_valid_magic(&self) -> bool {
        self.text_tag == padded::<TEXT_LEN>(HEADER_TEXT)
            && self.signature == padded::<SIGNATURE_LEN>(HEADER_SIGNATURE)
            && self.version == padded::<VERSION_LEN>(HEADER_VERSION)
    }

    /// Serialize to the fixed-size record
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(&self.text_tag);
        buf.put_slice(&padded::<BLOCK_NAME_LEN>(self.block_name_prefix.as_bytes()));
        buf.put_slice(&self.signature);
        buf.put_slice(&self.version);
        buf.put_u8(self.block_order);
        buf.put_u8(self.crypt_type.into());
        buf.put_u8(self.comp_type.into());
        buf.put_u8(0);
        buf.put_u64_le(self.image_size);
        buf.put_u64_le(self.snapshot_sequence);
        buf.put_u32_le(self.snapshot_count);
        buf.put_u32_le(self.reserved);
        buf.put_u64_le(self.snapshot_names_length);
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        buf.freeze()
    }

    /// Parse the fixed-size record from the start of `data`
    ///
    /// Magic values are not checked. Bytes past the record are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                need: HEADER_SIZE,
                have: data.len(),
            });
        }
        let mut buf = &data[..HEADER_SIZE];

        let mut text_tag = [0u8; TEXT_LEN];
        buf.copy_to_slice(&mut text_tag);

        let mut block_name = [0u8; BLOCK_NAME_LEN];
        buf.copy_to_slice(&mut block_name);
        let name_len = block_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(BLOCK_NAME_LEN);
        let name = &block_name[..name_len];
        if !name.iter().all(|b| b.is_ascii_graphic()) {
            return Err(FormatError::InvalidBlockName);
        }
        let block_name_prefix = String::from_utf8_lossy(name).into_owned();

        let mut signature = [0u8; SIGNATURE_LEN];
        buf.copy_to_slice(&mut signature);
        let mut version = [0u8; VERSION_LEN];
        buf.copy_to_slice(&mut version);

        let block_order = buf.get_u8();
        let crypt_type = CryptType::from(buf.get_u8());
        let comp_type = CompType::from(buf.get_u8());
        let _unused = buf.get_u8();

        Ok(Self {
            text_tag,
            block_name_prefix,
            signature,
            version,
            block_order,
            crypt_type,
            comp_type,
            image_size: buf.get_u64_le(),
            snapshot_sequence: buf.get_u64_le(),
            snapshot_count: buf.get_u32_le(),
            reserved: buf.get_u32_le(),
            snapshot_names_length: buf.get_u64_le(),
        })
    }
}

/// One entry of the inline snapshot table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineSnapshot {
    pub id: u64,
    pub image_size: u64,
    pub name: String,
}

/// Parse the snapshot table that follows the header in `object`
pub fn decode_snapshot_table(
    object: &[u8],
    header: &ImageHeader,
) -> Result<Vec<InlineSnapshot>, FormatError> {
    let count = header.snapshot_count as usize;
    let names_len = usize::try_from(header.snapshot_names_length)
        .map_err(|_| FormatError::SnapshotTable("names length overflows".into()))?;
    let need = count
        .checked_mul(SNAP_ENTRY_SIZE)
        .and_then(|n| n.checked_add(HEADER_SIZE))
        .and_then(|n| n.checked_add(names_len))
        .ok_or_else(|| FormatError::SnapshotTable("table size overflows".into()))?;
    if object.len() < need {
        return Err(FormatError::SnapshotTable(format!(
            "need {need} bytes, have {}",
            object.len()
        )));
    }

    let mut entries = &object[HEADER_SIZE..HEADER_SIZE + count * SNAP_ENTRY_SIZE];
    let names_start = HEADER_SIZE + count * SNAP_ENTRY_SIZE;
    let mut names = object[names_start..names_start + names_len]
        .split(|&b| b == 0)
        .map(|n| String::from_utf8_lossy(n).into_owned());

    let mut snaps = Vec::with_capacity(count);
    for _ in 0..count {
        let id = entries.get_u64_le();
        let image_size = entries.get_u64_le();
        let name = names
            .next()
            .ok_or_else(|| FormatError::SnapshotTable("missing snapshot name".into()))?;
        snaps.push(InlineSnapshot {
            id,
            image_size,
            name,
        });
    }
    Ok(snaps)
}

/// Serialize the header followed by `snaps`, updating the table counts
#[must_use]
pub fn encode_with_snapshot_table(header: &ImageHeader, snaps: &[InlineSnapshot]) -> Bytes {
    let mut header = header.clone();
    header.snapshot_count = u32::try_from(snaps.len()).unwrap_or(u32::MAX);
    header.snapshot_names_length = snaps.iter().map(|s| s.name.len() as u64 + 1).sum();

    let mut buf = BytesMut::with_capacity(
        HEADER_SIZE + snaps.len() * SNAP_ENTRY_SIZE + header.snapshot_names_length as usize,
    );
    buf.put_slice(&header.encode());
    for snap in snaps {
        buf.put_u64_le(snap.id);
        buf.put_u64_le(snap.image_size);
    }
    for snap in snaps {
        buf.put_slice(snap.name.as_bytes());
        buf.put_u8(0);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_create_header() {
        let header = ImageHeader::create(4096, 0, 0x1_0000_00ab, 22);
        assert_eq!(header.block_order, 22);
        assert_eq!(header.block_name_prefix, "rb.1.ab");
        assert_eq!(header.crypt_type, CryptType::None);
        assert_eq!(header.comp_type, CompType::None);
        assert!(header.has_valid_magic());

        let header = ImageHeader::create(4096, 20, 7, 22);
        assert_eq!(header.block_order, 20);
        assert_eq!(header.block_name_prefix, "rb.0.7");
    }

    #[test]
    fn test_encoded_layout() {
        let header = ImageHeader::create(10 << 20, 22, 1, 22);
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..HEADER_TEXT.len()], HEADER_TEXT);
        assert_eq!(&bytes[40..46], b"rb.0.1");
        assert_eq!(&bytes[64..67], b"RBD");
        assert_eq!(&bytes[68..75], b"001.005");
        assert_eq!(bytes[76], 22);
        assert_eq!(&bytes[80..88], &(10u64 << 20).to_le_bytes());
        // Deterministic
        assert_eq!(bytes, header.encode());
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = ImageHeader::create(1, 0, 1, 22).encode();
        let err = ImageHeader::decode(&bytes[..HEADER_SIZE - 1]).unwrap_err();
        assert_eq!(
            err,
            FormatError::Truncated {
                need: HEADER_SIZE,
                have: HEADER_SIZE - 1
            }
        );
    }

    #[test]
    fn test_decode_is_permissive() {
        let mut bytes = ImageHeader::create(1, 0, 1, 22).encode().to_vec();
        bytes[0] = b'X';
        bytes[64] = b'Z';
        let header = ImageHeader::decode(&bytes).unwrap();
        assert!(!header.has_valid_magic());
        assert_eq!(header.image_size, 1);
    }

    #[test]
    fn test_random_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..256 {
            let mut header = ImageHeader::create(rng.r#gen(), rng.gen_range(0..=30), rng.r#gen(), 22);
            header.crypt_type = CryptType::from(rng.gen_range(0..3u8));
            header.comp_type = CompType::from(rng.gen_range(0..3u8));
            header.snapshot_sequence = rng.r#gen();
            header.snapshot_count = rng.r#gen();
            header.reserved = rng.r#gen();
            header.snapshot_names_length = rng.r#gen();
            let decoded = ImageHeader::decode(&header.encode()).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_snapshot_table() {
        let header = ImageHeader::create(8192, 0, 3, 22);
        let snaps = vec![
            InlineSnapshot {
                id: 4,
                image_size: 4096,
                name: "s1".into(),
            },
            InlineSnapshot {
                id: 9,
                image_size: 8192,
                name: "nightly".into(),
            },
        ];
        let object = encode_with_snapshot_table(&header, &snaps);
        let decoded_header = ImageHeader::decode(&object).unwrap();
        assert_eq!(decoded_header.snapshot_count, 2);
        assert_eq!(decoded_header.snapshot_names_length, 11);
        assert_eq!(decode_snapshot_table(&object, &decoded_header).unwrap(), snaps);

        let err = decode_snapshot_table(&object[..object.len() - 1], &decoded_header).unwrap_err();
        assert!(matches!(err, FormatError::SnapshotTable(_)));
    }
}
