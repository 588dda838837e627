//! 128-bit identifiers for publications and mesh nodes.
//!
//! Generation is fast, not cryptographic: a Lehmer generator walks a
//! seed pool that was filled once from OS entropy, and the output is
//! masked with a per-process nonce. Mesh loop detection only needs ids
//! that are unique and totally ordered across the mesh.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

/// A 128-bit identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// The all-ones identifier, used as the mesh-id of a muted link so
    /// it can never win a minimum.
    pub const MAX: Uuid = Uuid([0xFF; 16]);

    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        GENERATOR.lock().next()
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({self})")
    }
}

struct Generator {
    nonce: [u64; 2],
    seeds: [u32; 4],
}

/// Lehmer / Park-Miller step.
const fn leprng(n: u32) -> u32 {
    ((n as u64 * 279_470_273) % 4_294_967_291) as u32
}

impl Generator {
    fn from_os_entropy() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let word = |i: usize| u64::from_le_bytes(bytes[i..i + 8].try_into().unwrap_or_default());
        let seed = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap_or_default());
        Self {
            nonce: [word(0), word(8)],
            seeds: [seed(16), seed(20), seed(24), seed(28)],
        }
    }

    fn next(&mut self) -> Uuid {
        let s0 = self.seeds[0];
        self.seeds[0] = leprng(self.seeds[1]);
        self.seeds[1] = leprng(self.seeds[2]);
        self.seeds[2] = leprng(self.seeds[3]);
        self.seeds[3] = leprng(s0);
        let lo = (u64::from(self.seeds[0]) | (u64::from(self.seeds[1]) << 32)) ^ self.nonce[0];
        let hi = (u64::from(self.seeds[2]) | (u64::from(self.seeds[3]) << 32)) ^ self.nonce[1];
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&lo.to_le_bytes());
        bytes[8..].copy_from_slice(&hi.to_le_bytes());
        Uuid(bytes)
    }
}

static GENERATOR: Lazy<Mutex<Generator>> = Lazy::new(|| Mutex::new(Generator::from_os_entropy()));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_differ() {
        let a = Uuid::generate();
        let b = Uuid::generate();
        assert_ne!(a, b);
        assert_ne!(a, Uuid::MAX);
    }

    #[test]
    fn display_format() {
        let uuid = Uuid::from_bytes([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ]);
        assert_eq!(
            uuid.to_string(),
            "01234567-89ab-cdef-0123-456789abcdef"
        );
    }

    #[test]
    fn max_orders_last() {
        for _ in 0..64 {
            assert!(Uuid::generate() <= Uuid::MAX);
        }
    }
}
