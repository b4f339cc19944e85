//! Little-endian wire encoding
//!
//! Integers are little-endian. Strings and blobs carry a u32 length prefix,
//! and maps carry a u32 entry count followed by key/value pairs.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Append-only encoder
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Create an empty encoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    /// Length-prefixed byte blob
    pub fn put_blob(&mut self, v: &[u8]) -> &mut Self {
        let len = u32::try_from(v.len()).unwrap_or(u32::MAX);
        self.buf.put_u32_le(len);
        self.buf.put_slice(&v[..len as usize]);
        self
    }

    /// Length-prefixed string
    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_blob(v.as_bytes())
    }

    /// Count-prefixed map of string keys to blob values
    pub fn put_map(&mut self, map: &BTreeMap<String, Bytes>) -> &mut Self {
        let count = u32::try_from(map.len()).unwrap_or(u32::MAX);
        self.buf.put_u32_le(count);
        for (key, value) in map.iter().take(count as usize) {
            self.put_str(key);
            self.put_blob(value);
        }
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish encoding
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked decoder over a byte slice
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to decode
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::decode(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    /// Length-prefixed byte blob
    pub fn get_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.need(len, "blob")?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Length-prefixed UTF-8 string
    pub fn get_string(&mut self) -> Result<String> {
        let raw = self.get_blob()?;
        String::from_utf8(raw.to_vec()).map_err(|e| Error::decode(format!("invalid string: {e}")))
    }

    /// Count-prefixed map of string keys to blob values
    pub fn get_map(&mut self) -> Result<BTreeMap<String, Bytes>> {
        let count = self.get_u32()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.get_string()?;
            let value = Bytes::copy_from_slice(self.get_blob()?);
            map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_encode_layout() {
        let mut enc = Encoder::new();
        enc.put_u8(b's').put_str("foo").put_blob(&[]);
        let bytes = enc.finish();
        assert_eq!(&bytes[..], b"s\x03\x00\x00\x00foo\x00\x00\x00\x00");
    }

    #[test]
    fn test_decode_map() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Bytes::new());
        map.insert("a".to_string(), Bytes::from_static(b"x"));
        let mut enc = Encoder::new();
        enc.put_blob(b"hdr").put_map(&map);
        let bytes = enc.finish();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.get_blob().unwrap(), b"hdr");
        let decoded = dec.get_map().unwrap();
        assert_eq!(decoded.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(dec.is_empty());
    }

    #[test]
    fn test_decode_truncated() {
        let mut dec = Decoder::new(&[1, 0, 0]);
        assert!(matches!(dec.get_u32(), Err(Error::Decode(_))));

        let mut dec = Decoder::new(&[9, 0, 0, 0, b'a']);
        assert!(dec.get_string().is_err());
    }

    #[test]
    fn test_decode_garbage_never_panics() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..64);
            let garbage: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            let mut dec = Decoder::new(&garbage);
            let _ = dec.get_blob();
            let _ = dec.get_map();
            assert!(dec.remaining() <= garbage.len());
        }
    }
}
