//! Canonical CBOR subset used by the wire protocol.
//!
//! Only the shapes the protocol emits are supported: definite-length
//! unsigned/negative integers, byte and text strings, arrays, maps,
//! tags, booleans and null. Integers always use the shortest header.
//! Indefinite lengths and floats are rejected.

use bytes::{BufMut, Bytes, BytesMut};

use weft_core::error::{Error, Result};

const MAJOR_UINT: u8 = 0;
const MAJOR_NEGINT: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_STRING: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const MAJOR_SIMPLE: u8 = 7;

const SIMPLE_FALSE: u8 = 20;
const SIMPLE_TRUE: u8 = 21;
const SIMPLE_NULL: u8 = 22;

/// Streaming CBOR encoder over a growable buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Finish encoding and take the buffer.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn header(&mut self, major: u8, value: u64) {
        let major = major << 5;
        if value < 24 {
            self.buf.put_u8(major | value as u8);
        } else if value <= u64::from(u8::MAX) {
            self.buf.put_u8(major | 24);
            self.buf.put_u8(value as u8);
        } else if value <= u64::from(u16::MAX) {
            self.buf.put_u8(major | 25);
            self.buf.put_u16(value as u16);
        } else if value <= u64::from(u32::MAX) {
            self.buf.put_u8(major | 26);
            self.buf.put_u32(value as u32);
        } else {
            self.buf.put_u8(major | 27);
            self.buf.put_u64(value);
        }
    }

    pub fn uint(&mut self, value: u64) {
        self.header(MAJOR_UINT, value);
    }

    pub fn int(&mut self, value: i64) {
        if value < 0 {
            self.header(MAJOR_NEGINT, !(value as u64));
        } else {
            self.header(MAJOR_UINT, value as u64);
        }
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.header(MAJOR_BYTES, data.len() as u64);
        self.buf.put_slice(data);
    }

    pub fn string(&mut self, data: &str) {
        self.header(MAJOR_STRING, data.len() as u64);
        self.buf.put_slice(data.as_bytes());
    }

    pub fn array(&mut self, len: usize) {
        self.header(MAJOR_ARRAY, len as u64);
    }

    pub fn map(&mut self, len: usize) {
        self.header(MAJOR_MAP, len as u64);
    }

    pub fn tag(&mut self, tag: u64) {
        self.header(MAJOR_TAG, tag);
    }

    pub fn bool(&mut self, value: bool) {
        self.buf
            .put_u8((MAJOR_SIMPLE << 5) | if value { SIMPLE_TRUE } else { SIMPLE_FALSE });
    }

    pub fn null(&mut self) {
        self.buf.put_u8((MAJOR_SIMPLE << 5) | SIMPLE_NULL);
    }

    /// Encode a nested structure as a wrapped byte string: the closure's
    /// output becomes the content of a single bstr item.
    pub fn wrap_bytes<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Encoder) -> Result<()>,
    {
        let mut inner = Encoder::new();
        f(&mut inner)?;
        self.bytes(&inner.buf);
        Ok(())
    }

    /// Splice pre-encoded CBOR into the stream unchanged. The caller
    /// must pass one or more complete items.
    pub fn raw(&mut self, encoded: &[u8]) {
        self.buf.put_slice(encoded);
    }
}

/// Decoded CBOR item kind, for callers that peek before committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Uint,
    NegInt,
    Bytes,
    String,
    Array,
    Map,
    Tag,
    Simple,
}

/// Cursor-based CBOR decoder borrowing from a frame.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or(Error::EndOfData)?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::EndOfData)?;
        let slice = self.buf.get(self.pos..end).ok_or(Error::EndOfData)?;
        self.pos = end;
        Ok(slice)
    }

    fn header(&mut self) -> Result<(u8, u64)> {
        let initial = self.byte()?;
        let major = initial >> 5;
        let additional = initial & 0x1F;
        let value = match additional {
            0..=23 => u64::from(additional),
            24 => u64::from(self.byte()?),
            25 => {
                let b = self.take(2)?;
                u64::from(u16::from_be_bytes([b[0], b[1]]))
            }
            26 => {
                let b = self.take(4)?;
                u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            27 => {
                let b = self.take(8)?;
                u64::from_be_bytes(b.try_into().map_err(|_| Error::EndOfData)?)
            }
            // Indefinite lengths and reserved values
            _ => return Err(Error::Invalid),
        };
        Ok((major, value))
    }

    /// Inspect the kind of the next item without consuming it.
    pub fn peek(&self) -> Result<Kind> {
        let initial = *self.buf.get(self.pos).ok_or(Error::EndOfData)?;
        Ok(match initial >> 5 {
            MAJOR_UINT => Kind::Uint,
            MAJOR_NEGINT => Kind::NegInt,
            MAJOR_BYTES => Kind::Bytes,
            MAJOR_STRING => Kind::String,
            MAJOR_ARRAY => Kind::Array,
            MAJOR_MAP => Kind::Map,
            MAJOR_TAG => Kind::Tag,
            _ => Kind::Simple,
        })
    }

    pub fn uint(&mut self) -> Result<u64> {
        let (major, value) = self.header()?;
        if major != MAJOR_UINT {
            return Err(Error::Invalid);
        }
        Ok(value)
    }

    pub fn int(&mut self) -> Result<i64> {
        let (major, value) = self.header()?;
        match major {
            MAJOR_UINT => i64::try_from(value).map_err(|_| Error::Invalid),
            MAJOR_NEGINT => {
                let value = i64::try_from(value).map_err(|_| Error::Invalid)?;
                Ok(-1 - value)
            }
            _ => Err(Error::Invalid),
        }
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let (major, len) = self.header()?;
        if major != MAJOR_BYTES {
            return Err(Error::Invalid);
        }
        self.take(usize::try_from(len).map_err(|_| Error::Invalid)?)
    }

    pub fn string(&mut self) -> Result<&'a str> {
        let (major, len) = self.header()?;
        if major != MAJOR_STRING {
            return Err(Error::Invalid);
        }
        let raw = self.take(usize::try_from(len).map_err(|_| Error::Invalid)?)?;
        std::str::from_utf8(raw).map_err(|_| Error::Invalid)
    }

    pub fn array(&mut self) -> Result<usize> {
        let (major, len) = self.header()?;
        if major != MAJOR_ARRAY {
            return Err(Error::Invalid);
        }
        usize::try_from(len).map_err(|_| Error::Invalid)
    }

    pub fn map(&mut self) -> Result<usize> {
        let (major, len) = self.header()?;
        if major != MAJOR_MAP {
            return Err(Error::Invalid);
        }
        usize::try_from(len).map_err(|_| Error::Invalid)
    }

    pub fn tag(&mut self) -> Result<u64> {
        let (major, value) = self.header()?;
        if major != MAJOR_TAG {
            return Err(Error::Invalid);
        }
        Ok(value)
    }

    pub fn bool(&mut self) -> Result<bool> {
        let (major, value) = self.header()?;
        if major != MAJOR_SIMPLE {
            return Err(Error::Invalid);
        }
        match value as u8 {
            SIMPLE_FALSE => Ok(false),
            SIMPLE_TRUE => Ok(true),
            _ => Err(Error::Invalid),
        }
    }

    pub fn null(&mut self) -> Result<()> {
        let (major, value) = self.header()?;
        if major != MAJOR_SIMPLE || value as u8 != SIMPLE_NULL {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    /// Consume one complete item and return its raw encoded bytes.
    /// Used where a span must be re-emitted or authenticated unchanged.
    pub fn raw_item(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        self.skip()?;
        Ok(&self.buf[start..self.pos])
    }

    /// Skip one complete item, recursing into containers. Decoders use
    /// this to tolerate map keys they do not understand.
    pub fn skip(&mut self) -> Result<()> {
        let (major, value) = self.header()?;
        match major {
            MAJOR_UINT | MAJOR_NEGINT | MAJOR_SIMPLE => {}
            MAJOR_BYTES | MAJOR_STRING => {
                self.take(usize::try_from(value).map_err(|_| Error::Invalid)?)?;
            }
            MAJOR_ARRAY => {
                for _ in 0..value {
                    self.skip()?;
                }
            }
            MAJOR_MAP => {
                for _ in 0..value {
                    self.skip()?;
                    self.skip()?;
                }
            }
            MAJOR_TAG => self.skip()?,
            _ => return Err(Error::Invalid),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<F: FnOnce(&mut Encoder)>(f: F) -> Bytes {
        let mut enc = Encoder::new();
        f(&mut enc);
        enc.into_bytes()
    }

    #[test]
    fn uint_boundaries() {
        for (value, expect) in [
            (0u64, "00"),
            (23, "17"),
            (24, "1818"),
            (255, "18ff"),
            (256, "190100"),
            (65535, "19ffff"),
            (65536, "1a00010000"),
            (u64::from(u32::MAX), "1affffffff"),
            (u64::from(u32::MAX) + 1, "1b0000000100000000"),
        ] {
            let bytes = encode(|e| e.uint(value));
            assert_eq!(hex::encode(&bytes), expect, "{value}");
            assert_eq!(Decoder::new(&bytes).uint().unwrap(), value);
        }
    }

    #[test]
    fn negative_ints() {
        for (value, expect) in [(-1i64, "20"), (-24, "37"), (-25, "3818"), (-256, "38ff"), (-257, "390100")] {
            let bytes = encode(|e| e.int(value));
            assert_eq!(hex::encode(&bytes), expect, "{value}");
            assert_eq!(Decoder::new(&bytes).int().unwrap(), value);
        }
        // Positive values decode through int() too
        let bytes = encode(|e| e.int(42));
        assert_eq!(Decoder::new(&bytes).int().unwrap(), 42);
    }

    #[test]
    fn strings_and_bytes() {
        let bytes = encode(|e| {
            e.string("Encrypt0");
            e.bytes(b"\x01\x02\x03");
        });
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.string().unwrap(), "Encrypt0");
        assert_eq!(dec.bytes().unwrap(), b"\x01\x02\x03");
        assert!(dec.is_at_end());
    }

    #[test]
    fn containers_and_tags() {
        let bytes = encode(|e| {
            e.tag(96);
            e.array(2);
            e.map(1);
            e.uint(1);
            e.int(-6);
            e.null();
        });
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.tag().unwrap(), 96);
        assert_eq!(dec.array().unwrap(), 2);
        assert_eq!(dec.map().unwrap(), 1);
        assert_eq!(dec.uint().unwrap(), 1);
        assert_eq!(dec.int().unwrap(), -6);
        dec.null().unwrap();
    }

    #[test]
    fn wrapped_byte_strings_nest() {
        let bytes = encode(|e| {
            e.wrap_bytes(|inner| {
                inner.map(1);
                inner.uint(1);
                inner.int(3);
                Ok(())
            })
            .unwrap();
        });
        let mut dec = Decoder::new(&bytes);
        let inner = dec.bytes().unwrap();
        let mut inner_dec = Decoder::new(inner);
        assert_eq!(inner_dec.map().unwrap(), 1);
        assert_eq!(inner_dec.uint().unwrap(), 1);
        assert_eq!(inner_dec.int().unwrap(), 3);
    }

    #[test]
    fn skip_steps_over_nested_items() {
        let bytes = encode(|e| {
            e.map(2);
            e.uint(99);
            e.array(2);
            e.string("x");
            e.map(1);
            e.uint(1);
            e.bytes(b"abc");
            e.uint(7);
            e.bool(true);
        });
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.map().unwrap(), 2);
        assert_eq!(dec.uint().unwrap(), 99);
        dec.skip().unwrap();
        assert_eq!(dec.uint().unwrap(), 7);
        assert!(dec.bool().unwrap());
        assert!(dec.is_at_end());
    }

    #[test]
    fn truncated_input_is_end_of_data() {
        let bytes = encode(|e| e.bytes(&[0u8; 64]));
        let mut dec = Decoder::new(&bytes[..10]);
        assert_eq!(dec.bytes().unwrap_err(), Error::EndOfData);
    }

    #[test]
    fn indefinite_lengths_are_rejected() {
        // 0x5f starts an indefinite-length byte string
        let mut dec = Decoder::new(&[0x5f, 0x41, 0x00, 0xff]);
        assert_eq!(dec.bytes().unwrap_err(), Error::Invalid);
    }
}
