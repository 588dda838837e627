//! Fixed-width bit vectors and Bloom filter operations.
//!
//! A `BitVector` is the lossy set representation the whole fabric routes
//! on: topics hash into it, subscriptions union into it, and forwarding
//! reduces to subset tests between vectors. Two flavors exist: the
//! configured routing width (a multiple of 64, 8192 by default) and the
//! fixed 256-bit fuzzy-hash width used as a compact summary.
//!
//! The wire form is `[flags, bit-length, bytes]`; the byte payload is
//! run-length encoded when the vector is sparse (or the complement when
//! it is dense), raw otherwise. The RLE scheme codes a run of `z` zeros
//! followed by a one as `w` zero bits, a `1` bit, then `w` little-endian
//! bits holding `z - (2^w - 1)` where `w = floor(log2(z + 1))`:
//!
//! ```text
//! prefix        count width    range encoded
//! --------------------------------------------
//! 01               1 bit           1 ..    2
//! 001              2 bit           3 ..    6
//! 0001             3 bit           7 ..   14
//! 00001            4 bit          15 ..   30
//! ...
//! ```

use sha2::{Digest, Sha256};

use crate::config::FUZZY_BIT_LEN;
use crate::error::{Error, Result};

const CHUNK_BITS: usize = 64;

/// Serialized payload is run-length encoded.
pub const FLAG_RLE_ENCODED: u8 = 0x01;

/// The complement of the vector was encoded.
pub const FLAG_RLE_COMPLEMENT: u8 = 0x02;

/// RLE pays off below this load factor (percent).
const RLE_LOAD_LOW: f32 = 30.0;

/// Above this load factor the complement is sparse enough to RLE.
const RLE_LOAD_HIGH: f32 = 70.0;

/// Maximum Bloom hashes per inserted token.
pub const MAX_HASHES: u8 = 16;

/// A fixed-width bit set.
///
/// The population count is cached across read-only queries and
/// invalidated by mutation; equality and subset tests are only defined
/// between vectors of the same width.
#[derive(Debug, Clone)]
pub struct BitVector {
    len: usize,
    pop: Option<u32>,
    bits: Vec<u64>,
}

impl BitVector {
    /// Allocate a cleared vector of `len` bits. `len` must be a non-zero
    /// multiple of 64.
    #[must_use]
    pub fn new(len: usize) -> Self {
        assert!(len > 0 && len % CHUNK_BITS == 0);
        Self {
            len,
            pop: Some(0),
            bits: vec![0u64; len / CHUNK_BITS],
        }
    }

    /// Allocate a vector sized for use as a fuzzy hash.
    #[must_use]
    pub fn new_fuzzy() -> Self {
        Self::new(FUZZY_BIT_LEN)
    }

    /// Width in bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_clear()
    }

    /// Raw chunk access for codecs.
    #[must_use]
    pub(crate) fn chunks(&self) -> &[u64] {
        &self.bits
    }

    fn test_bit(&self, pos: usize) -> bool {
        self.bits[pos >> 6] & (1u64 << (pos & 0x3F)) != 0
    }

    pub(crate) fn set_bit(&mut self, pos: usize) {
        self.bits[pos >> 6] |= 1u64 << (pos & 0x3F);
        self.pop = None;
    }

    /// Number of bits set.
    #[must_use]
    pub fn pop_count(&self) -> u32 {
        match self.pop {
            Some(n) => n,
            None => self.bits.iter().map(|c| c.count_ones()).sum(),
        }
    }

    /// Percentage of bits set, in the range 0.0..=100.0.
    #[must_use]
    pub fn load_factor(&self) -> f32 {
        (100.0 * self.pop_count() as f32 + 1.0) / self.len as f32
    }

    /// True when no bit is set.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        match self.pop {
            Some(n) => n == 0,
            None => self.bits.iter().all(|c| *c == 0),
        }
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        if self.pop != Some(0) {
            self.bits.fill(0);
            self.pop = Some(0);
        }
    }

    /// Set every bit.
    pub fn fill(&mut self) {
        self.bits.fill(!0u64);
        self.pop = Some(self.len as u32);
    }

    /// Flip every bit.
    pub fn complement(&mut self) {
        for chunk in &mut self.bits {
            *chunk = !*chunk;
        }
        self.pop = self.pop.map(|n| self.len as u32 - n);
    }

    /// Overwrite this vector with the contents of `src`.
    pub fn copy_from(&mut self, src: &BitVector) {
        assert_eq!(self.len, src.len);
        self.bits.copy_from_slice(&src.bits);
        self.pop = src.pop;
    }

    /// Overwrite the bit array from raw little-endian bytes. The length
    /// must match the vector width exactly.
    pub fn set_bits(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.len / 8 {
            return Err(Error::InvalidArgs);
        }
        for (chunk, src) in self.bits.iter_mut().zip(data.chunks_exact(8)) {
            *chunk = u64::from_le_bytes(src.try_into().map_err(|_| Error::InvalidArgs)?);
        }
        self.pop = None;
        Ok(())
    }

    /// The bit array as little-endian bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len / 8);
        for chunk in &self.bits {
            out.extend_from_slice(&chunk.to_le_bytes());
        }
        out
    }

    /// Bloom insertion: hash `data` with SHA-256 and set `num_hashes`
    /// bits derived from the digest words.
    pub fn bloom_insert(&mut self, data: &[u8], num_hashes: u8) {
        debug_assert!((1..=MAX_HASHES).contains(&num_hashes));
        for word in digest_words(data).into_iter().take(num_hashes as usize) {
            let index = word as usize % self.len;
            self.set_bit(index);
        }
        self.pop = None;
    }

    /// Bloom membership test for `data`.
    #[must_use]
    pub fn bloom_test(&self, data: &[u8], num_hashes: u8) -> bool {
        digest_words(data)
            .into_iter()
            .take(num_hashes as usize)
            .all(|word| self.test_bit(word as usize % self.len))
    }

    /// OR `other` into this vector.
    pub fn union_with(&mut self, other: &BitVector) {
        assert_eq!(self.len, other.len);
        for (dst, src) in self.bits.iter_mut().zip(&other.bits) {
            *dst |= *src;
        }
        self.pop = None;
    }

    /// AND `other` into this vector.
    pub fn intersect_with(&mut self, other: &BitVector) {
        assert_eq!(self.len, other.len);
        let mut any = false;
        for (dst, src) in self.bits.iter_mut().zip(&other.bits) {
            *dst &= *src;
            any |= *dst != 0;
        }
        self.pop = if any { None } else { Some(0) };
    }

    /// XOR `other` into this vector. Returns true when the two inputs
    /// were identical (the result is then all zero).
    pub fn xor_with(&mut self, other: &BitVector) -> bool {
        assert_eq!(self.len, other.len);
        let mut diff = false;
        for (dst, src) in self.bits.iter_mut().zip(&other.bits) {
            *dst ^= *src;
            diff |= *dst != 0;
        }
        self.pop = if diff { None } else { Some(0) };
        !diff
    }

    /// True when every bit set in `other` is also set in this vector.
    /// False when this vector is all zero or the widths differ.
    #[must_use]
    pub fn includes(&self, other: &BitVector) -> bool {
        if self.len != other.len {
            return false;
        }
        let mut union = 0u64;
        for (a, b) in self.bits.iter().zip(&other.bits) {
            if a & b != *b {
                return false;
            }
            union |= *a;
        }
        union != 0
    }

    /// Compute the similarity-preserving hash of this vector.
    ///
    /// The hash is monotone under inclusion: if `a.includes(b)` then
    /// `a.fuzzy_hash().includes(b.fuzzy_hash())`. Words 0..3 fold the
    /// vector's OR-squash through fixed rotation sets; word 3 encodes a
    /// saturating unary population count.
    #[must_use]
    pub fn fuzzy_hash(&self) -> BitVector {
        let mut hash = Self::new_fuzzy();
        let mut squash = 0u64;
        let mut pop = 0u32;
        for chunk in &self.bits {
            pop += chunk.count_ones();
            squash |= *chunk;
        }
        if pop == 0 {
            return hash;
        }
        let mut p = squash;
        p |= p.rotate_left(7);
        p |= p.rotate_left(31);
        hash.bits[0] = p;
        p = squash;
        p |= p.rotate_left(11);
        p |= p.rotate_left(29);
        p |= p.rotate_left(37);
        hash.bits[1] = p;
        p = squash;
        p |= p.rotate_left(13);
        p |= p.rotate_left(17);
        p |= p.rotate_left(19);
        p |= p.rotate_left(41);
        hash.bits[2] = p;
        hash.bits[3] = if pop > 62 { !0u64 } else { (1u64 << pop) - 1 };
        hash.pop = None;
        hash
    }

    /// Choose the wire encoding for this vector and produce the payload
    /// bytes. Returns `(flags, payload)`; an RLE attempt that would
    /// exceed the raw size falls back to raw.
    #[must_use]
    pub fn to_wire(&self) -> (u8, Vec<u8>) {
        let load = self.load_factor();
        let flags = if load < RLE_LOAD_LOW {
            FLAG_RLE_ENCODED
        } else if load > RLE_LOAD_HIGH {
            FLAG_RLE_ENCODED | FLAG_RLE_COMPLEMENT
        } else {
            0
        };
        if flags & FLAG_RLE_ENCODED != 0 {
            if let Ok(packed) = self.rle_encode(flags & FLAG_RLE_COMPLEMENT != 0) {
                return (flags, packed);
            }
        }
        (0, self.to_bytes())
    }

    /// Rebuild a vector of `len` bits from its wire payload.
    pub fn from_wire(len: usize, flags: u8, data: &[u8]) -> Result<Self> {
        if len == 0 || len % CHUNK_BITS != 0 {
            tracing::warn!(len, "deserialized bit vector has an unusable length");
            return Err(Error::Invalid);
        }
        let mut bv = Self::new(len);
        if flags & FLAG_RLE_ENCODED != 0 {
            rle_decode(data, &mut bv.bits, len)?;
            bv.pop = None;
            if flags & FLAG_RLE_COMPLEMENT != 0 {
                bv.complement();
            }
        } else if data.len() == len / 8 {
            bv.set_bits(data)?;
        } else {
            tracing::warn!(len, bytes = data.len(), "raw bit vector has the wrong length");
            return Err(Error::Invalid);
        }
        Ok(bv)
    }

    /// Run-length encode this vector (or its complement). Fails with
    /// `Error::Overflow` when the encoding would be larger than raw.
    fn rle_encode(&self, complement: bool) -> Result<Vec<u8>> {
        let mask = if complement { !0u64 } else { 0u64 };
        let mut packed = vec![0u8; self.len / 8];
        let mut rle_size: usize = 0;
        let mut num0: u32 = 0;

        if !complement && self.pop_count() == 0 {
            return Ok(Vec::new());
        }
        for raw in &self.bits {
            let mut chunk = *raw ^ mask;
            if chunk == 0 {
                num0 += CHUNK_BITS as u32;
                continue;
            }
            let mut rem0 = CHUNK_BITS as u32;
            while chunk != 0 {
                let tz = chunk.trailing_zeros();
                chunk >>= tz;
                rem0 -= tz + 1;
                num0 += tz;
                let width = (num0 + 1).ilog2() as usize;
                let mut val = num0 - ((1u32 << width) - 1);
                if rle_size + 2 * width + 1 > self.len {
                    return Err(Error::Overflow);
                }
                rle_size += width;
                set_bit8(&mut packed, rle_size);
                rle_size += 1;
                // Length of the zero run, little-endian
                for _ in 0..width {
                    if val & 1 != 0 {
                        set_bit8(&mut packed, rle_size);
                    }
                    val >>= 1;
                    rle_size += 1;
                }
                chunk >>= 1;
                num0 = 0;
            }
            num0 = rem0;
        }
        if rle_size > self.len {
            return Err(Error::Overflow);
        }
        packed.truncate((rle_size + 7) / 8);
        Ok(packed)
    }
}

impl PartialEq for BitVector {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.bits == other.bits
    }
}

impl Eq for BitVector {}

/// Bit positions derived from the SHA-256 digest of `data`, enough for
/// the maximum configurable hash count.
fn digest_words(data: &[u8]) -> [u32; MAX_HASHES as usize] {
    let mut words = [0u32; MAX_HASHES as usize];
    let digest = Sha256::digest(data);
    for (word, src) in words.iter_mut().take(8).zip(digest.chunks_exact(4)) {
        *word = u32::from_le_bytes(src.try_into().unwrap_or_default());
    }
    // Hash counts past the digest width chain a second digest
    let digest2 = Sha256::digest(digest);
    for (word, src) in words.iter_mut().skip(8).zip(digest2.chunks_exact(4)) {
        *word = u32::from_le_bytes(src.try_into().unwrap_or_default());
    }
    words
}

fn set_bit8(bytes: &mut [u8], pos: usize) {
    bytes[pos >> 3] |= 1 << (pos & 0x7);
}

/// Bits are kept topped up in a 64-bit window so run lengths can be
/// extracted with a mask.
const TOP_UP_THRESHOLD: usize = 56;

fn rle_decode(packed: &[u8], bits: &mut [u64], len: usize) -> Result<()> {
    let mut input = packed.iter().copied();
    let mut remaining = packed.len();
    let mut current: u64 = 0;
    let mut current_bits: usize = 0;
    let mut bit_pos: usize = 0;

    if let Some(byte) = input.next() {
        current = u64::from(byte);
        current_bits = 8;
        remaining -= 1;
    }
    while current_bits > 0 {
        while remaining > 0 && current_bits <= TOP_UP_THRESHOLD {
            if let Some(byte) = input.next() {
                current |= u64::from(byte) << current_bits;
                current_bits += 8;
                remaining -= 1;
            }
        }
        if current == 0 {
            if remaining != 0 {
                return Err(Error::Invalid);
            }
            break;
        }
        if current & 1 != 0 {
            current >>= 1;
            current_bits -= 1;
        } else {
            let tz = current.trailing_zeros() as usize;
            let Some(rest) = current_bits.checked_sub(1 + 2 * tz) else {
                return Err(Error::Invalid);
            };
            current >>= tz + 1;
            let val = current & ((1u64 << tz) - 1);
            let num0 = val + ((1u64 << tz) - 1);
            bit_pos += num0 as usize;
            current_bits = rest;
            current >>= tz;
        }
        if bit_pos >= len {
            return Err(Error::Invalid);
        }
        bits[bit_pos >> 6] |= 1u64 << (bit_pos & 0x3F);
        bit_pos += 1;
    }
    Ok(())
}
