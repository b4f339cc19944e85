//! Trivial map (TMAP) objects
//!
//! A TMAP object holds a length-prefixed opaque header blob followed by a
//! count-prefixed ordered map of string keys to blob values. Clients never
//! rewrite the whole object; they submit a sequence of edits that the store
//! applies atomically.

use bytes::Bytes;
use rbdio_common::{Decoder, Encoder, Error, Result};
use std::collections::BTreeMap;

/// Replace the header blob
pub const TMAP_HDR: u8 = b'h';
/// Set a key, overwriting any existing value
pub const TMAP_SET: u8 = b's';
/// Create a key, failing if it exists
pub const TMAP_CREATE: u8 = b'c';
/// Remove a key, failing if it is absent
pub const TMAP_RM: u8 = b'r';
/// Remove a key if present
pub const TMAP_RMSLOPPY: u8 = b'R';

/// One TMAP edit
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TmapEdit {
    Header(Bytes),
    Set(String, Bytes),
    Create(String, Bytes),
    Remove(String),
    RemoveSloppy(String),
}

impl TmapEdit {
    /// Append this edit's wire form to `enc`
    pub fn encode_into(&self, enc: &mut Encoder) {
        match self {
            Self::Header(hdr) => {
                enc.put_u8(TMAP_HDR).put_blob(hdr);
            }
            Self::Set(key, value) => {
                enc.put_u8(TMAP_SET).put_str(key).put_blob(value);
            }
            Self::Create(key, value) => {
                enc.put_u8(TMAP_CREATE).put_str(key).put_blob(value);
            }
            Self::Remove(key) => {
                enc.put_u8(TMAP_RM).put_str(key);
            }
            Self::RemoveSloppy(key) => {
                enc.put_u8(TMAP_RMSLOPPY).put_str(key);
            }
        }
    }

    /// Encode a batch of edits
    #[must_use]
    pub fn encode_all(edits: &[Self]) -> Bytes {
        let mut enc = Encoder::new();
        for edit in edits {
            edit.encode_into(&mut enc);
        }
        enc.finish()
    }

    /// Decode a batch of edits
    pub fn decode_all(buf: &[u8]) -> Result<Vec<Self>> {
        let mut dec = Decoder::new(buf);
        let mut edits = Vec::new();
        while !dec.is_empty() {
            let op = dec.get_u8()?;
            let edit = match op {
                TMAP_HDR => Self::Header(Bytes::copy_from_slice(dec.get_blob()?)),
                TMAP_SET => {
                    let key = dec.get_string()?;
                    Self::Set(key, Bytes::copy_from_slice(dec.get_blob()?))
                }
                TMAP_CREATE => {
                    let key = dec.get_string()?;
                    Self::Create(key, Bytes::copy_from_slice(dec.get_blob()?))
                }
                TMAP_RM => Self::Remove(dec.get_string()?),
                TMAP_RMSLOPPY => Self::RemoveSloppy(dec.get_string()?),
                other => {
                    return Err(Error::invalid_argument(format!(
                        "unknown tmap op {other:#04x}"
                    )));
                }
            };
            edits.push(edit);
        }
        Ok(edits)
    }
}

/// Decoded contents of a TMAP object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tmap {
    pub header: Bytes,
    pub entries: BTreeMap<String, Bytes>,
}

impl Tmap {
    /// Decode an object body. An empty body is an empty map.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Ok(Self::default());
        }
        let mut dec = Decoder::new(buf);
        let header = Bytes::copy_from_slice(dec.get_blob()?);
        let entries = dec.get_map()?;
        Ok(Self { header, entries })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.put_blob(&self.header).put_map(&self.entries);
        enc.finish()
    }

    /// Apply edits in order. On error the map may be partially edited, so
    /// callers apply to a copy and commit only on success.
    pub fn apply(&mut self, edits: Vec<TmapEdit>, pool: &str, oid: &str) -> Result<()> {
        for edit in edits {
            match edit {
                TmapEdit::Header(hdr) => self.header = hdr,
                TmapEdit::Set(key, value) => {
                    self.entries.insert(key, value);
                }
                TmapEdit::Create(key, value) => {
                    if self.entries.contains_key(&key) {
                        return Err(Error::ObjectAlreadyExists {
                            pool: pool.to_string(),
                            oid: format!("{oid}[{key}]"),
                        });
                    }
                    self.entries.insert(key, value);
                }
                TmapEdit::Remove(key) => {
                    if self.entries.remove(&key).is_none() {
                        return Err(Error::not_found(pool, format!("{oid}[{key}]")));
                    }
                }
                TmapEdit::RemoveSloppy(key) => {
                    self.entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_wire_form() {
        let bytes = TmapEdit::encode_all(&[TmapEdit::Set("foo".into(), Bytes::new())]);
        assert_eq!(&bytes[..], b"s\x03\x00\x00\x00foo\x00\x00\x00\x00");
        let bytes = TmapEdit::encode_all(&[TmapEdit::Remove("foo".into())]);
        assert_eq!(&bytes[..], b"r\x03\x00\x00\x00foo");
    }

    #[test]
    fn test_apply_edits() {
        let mut map = Tmap::default();
        let edits = TmapEdit::decode_all(&TmapEdit::encode_all(&[
            TmapEdit::Set("b".into(), Bytes::new()),
            TmapEdit::Set("a".into(), Bytes::new()),
            TmapEdit::Set("a".into(), Bytes::new()),
        ]))
        .unwrap();
        map.apply(edits, "rbd", "dir").unwrap();
        assert_eq!(map.entries.keys().collect::<Vec<_>>(), vec!["a", "b"]);

        let decoded = Tmap::decode(&map.encode()).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_remove_missing_key() {
        let mut map = Tmap::default();
        let err = map
            .apply(vec![TmapEdit::Remove("x".into())], "rbd", "dir")
            .unwrap_err();
        assert!(err.is_not_found());
        map.apply(vec![TmapEdit::RemoveSloppy("x".into())], "rbd", "dir")
            .unwrap();
    }

    #[test]
    fn test_unknown_op() {
        assert!(TmapEdit::decode_all(b"z").is_err());
    }
}
