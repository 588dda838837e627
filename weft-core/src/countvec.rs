//! Per-bit counters over bit vectors.
//!
//! A `CountVector` aggregates many bit vectors so that individual
//! contributions can later be removed: each `add` increments a counter
//! behind every set bit and each `del` decrements it. A mirror bit
//! vector tracks "counter > 0" incrementally, so the live union is
//! available without a scan.

use crate::bitvec::BitVector;
use crate::error::{Error, Result};

/// Maximum number of vectors that may be added at once.
pub const COUNTER_MAX: u16 = u16::MAX;

const CHUNK_BITS: usize = 64;

/// A multiset of same-width bit vectors exposing their union and
/// intersection.
#[derive(Debug, Clone)]
pub struct CountVector {
    entries: u16,
    counts: Vec<u16>,
    union: BitVector,
}

impl CountVector {
    /// Allocate a count vector for `len`-bit contributions.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            entries: 0,
            counts: vec![0u16; len],
            union: BitVector::new(len),
        }
    }

    /// Allocate a count vector at the fuzzy-hash width.
    #[must_use]
    pub fn new_fuzzy() -> Self {
        Self::new(crate::config::FUZZY_BIT_LEN)
    }

    /// Number of vectors currently added.
    #[must_use]
    pub const fn entries(&self) -> u16 {
        self.entries
    }

    /// Add a vector's bits to the counters.
    pub fn add(&mut self, bv: &BitVector) -> Result<()> {
        if self.entries == COUNTER_MAX {
            return Err(Error::Resources);
        }
        if bv.len() != self.counts.len() {
            return Err(Error::InvalidArgs);
        }
        if !bv.is_clear() {
            for (i, chunk) in bv.chunks().iter().enumerate() {
                let mut chunk = *chunk;
                let mut bit = i * CHUNK_BITS;
                while chunk != 0 {
                    if chunk & 1 != 0 {
                        self.counts[bit] += 1;
                    }
                    chunk >>= 1;
                    bit += 1;
                }
            }
            self.union.union_with(bv);
        }
        self.entries += 1;
        Ok(())
    }

    /// Remove a previously added vector's bits from the counters. The
    /// vector must match one added earlier or the counters are left
    /// meaningless.
    pub fn del(&mut self, bv: &BitVector) -> Result<()> {
        if self.entries == 0 || bv.len() != self.counts.len() {
            return Err(Error::InvalidArgs);
        }
        if !bv.is_clear() {
            let mut cleared = BitVector::new(bv.len());
            for (i, chunk) in bv.chunks().iter().enumerate() {
                let mut chunk = *chunk;
                let mut bit = i * CHUNK_BITS;
                while chunk != 0 {
                    if chunk & 1 != 0 {
                        let count = &mut self.counts[bit];
                        *count = count.checked_sub(1).ok_or(Error::InvalidArgs)?;
                        if *count == 0 {
                            cleared.set_bit(bit);
                        }
                    }
                    chunk >>= 1;
                    bit += 1;
                }
            }
            self.union.xor_with(&cleared);
        }
        self.entries -= 1;
        Ok(())
    }

    /// The union of all added vectors.
    #[must_use]
    pub fn to_union(&self) -> BitVector {
        self.union.clone()
    }

    /// Bits set in every added vector.
    #[must_use]
    pub fn to_intersection(&self) -> BitVector {
        let mut bv = BitVector::new(self.counts.len());
        if self.entries > 0 {
            for (bit, count) in self.counts.iter().enumerate() {
                if *count == self.entries {
                    bv.set_bit(bit);
                }
            }
        }
        bv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_with(tokens: &[&str]) -> BitVector {
        let mut bv = BitVector::new(256);
        for t in tokens {
            bv.bloom_insert(t.as_bytes(), 4);
        }
        bv
    }

    #[test]
    fn mirror_tracks_union() {
        let a = vec_with(&["a"]);
        let b = vec_with(&["b"]);
        let mut cv = CountVector::new(256);
        cv.add(&a).unwrap();
        cv.add(&b).unwrap();

        let mut expect = a.clone();
        expect.union_with(&b);
        assert_eq!(cv.to_union(), expect);

        cv.del(&a).unwrap();
        assert_eq!(cv.to_union(), b);
        cv.del(&b).unwrap();
        assert!(cv.to_union().is_clear());
        assert_eq!(cv.entries(), 0);
    }

    #[test]
    fn overlapping_adds_survive_one_del() {
        let shared = vec_with(&["x", "y"]);
        let mut cv = CountVector::new(256);
        cv.add(&shared).unwrap();
        cv.add(&shared).unwrap();
        cv.del(&shared).unwrap();
        assert_eq!(cv.to_union(), shared);
    }

    #[test]
    fn intersection_requires_all_entries() {
        let a = vec_with(&["common", "only-a"]);
        let b = vec_with(&["common", "only-b"]);
        let mut cv = CountVector::new(256);
        cv.add(&a).unwrap();
        cv.add(&b).unwrap();

        let mut expect = a.clone();
        expect.intersect_with(&b);
        assert_eq!(cv.to_intersection(), expect);
    }

    #[test]
    fn del_without_add_is_an_error() {
        let mut cv = CountVector::new(256);
        assert_eq!(cv.del(&BitVector::new(256)), Err(Error::InvalidArgs));
    }

    #[test]
    fn clear_vector_add_counts_an_entry() {
        let mut cv = CountVector::new(256);
        cv.add(&BitVector::new(256)).unwrap();
        assert_eq!(cv.entries(), 1);
        assert!(cv.to_union().is_clear());
        // Intersection over a single clear entry is clear
        assert!(cv.to_intersection().is_clear());
    }

    #[test]
    fn balanced_sequences_restore_the_mirror() {
        let a = vec_with(&["p"]);
        let b = vec_with(&["q"]);
        let c = vec_with(&["p", "q"]);
        let mut cv = CountVector::new(256);
        for _ in 0..3 {
            cv.add(&a).unwrap();
            cv.add(&b).unwrap();
            cv.add(&c).unwrap();
            cv.del(&b).unwrap();
            cv.del(&c).unwrap();
        }
        let mut expect = a.clone();
        expect.union_with(&a);
        assert_eq!(cv.to_union(), expect);
        for _ in 0..3 {
            cv.del(&a).unwrap();
        }
        assert!(cv.to_union().is_clear());
    }
}
