//! Identifier space: a fixed-width hash with an XOR distance metric.
//!
//! The original implementation hashed with the host language's built-in
//! (unseeded, per-process) hash function, which made two runs of the same
//! scenario produce different routing tables. Here the hasher is keyed with
//! a fixed seed so that a given network of node ids always produces the
//! same identifier space, run after run.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// Width, in bits, of the identifier space.
pub const HASH_BITS: u32 = 64;

/// Fixed SipHash-1-3 key. Chosen once and never varied, so hashing is
/// reproducible across runs and platforms.
const DEFAULT_HASH_SEED: (u64, u64) = (0x5f3759df_9e3779b9, 0xc2b2ae3d_27d4eb2f);

/// XOR distance between two [`Hash`] values.
pub type Distance = u64;

/// A point in the 64-bit identifier space shared by node ids, content keys,
/// and anything else the DHT needs to place on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash {
    value: u64,
}

impl Hash {
    /// Hashes a node id. Numeric ids are rendered as a hex string first,
    /// mirroring the extra-entropy trick the original used for plain ints.
    pub fn of_id(id: u64) -> Self {
        Self::of_bytes(format!("0x{:x}", id).as_bytes())
    }

    /// Hashes raw bytes (e.g. a content segment) directly, with no
    /// transformation.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = SipHasher13::new_with_keys(DEFAULT_HASH_SEED.0, DEFAULT_HASH_SEED.1);
        hasher.write(data);
        Hash {
            value: hasher.finish(),
        }
    }

    /// The raw 64-bit value, mostly useful for logging and tests.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// XOR distance to another hash.
    pub fn xor(&self, other: Hash) -> Distance {
        self.value ^ other.value
    }

    /// Number of leading bits `self` and `other` share, i.e. the length of
    /// the run of leading zero bits in their XOR. Two equal hashes share
    /// all `HASH_BITS` bits.
    pub fn shared_upper_bits(&self, other: Hash) -> u32 {
        self.xor(other).leading_zeros()
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.value)
    }
}

/// Free-function form of [`Hash::xor`], handy when neither side is
/// conceptually "self".
pub fn xor(a: Hash, b: Hash) -> Distance {
    a.xor(b)
}

/// Free-function form of [`Hash::shared_upper_bits`].
pub fn shared_upper_bits(a: Hash, b: Hash) -> u32 {
    a.shared_upper_bits(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_hashes_the_same() {
        assert_eq!(Hash::of_id(42), Hash::of_id(42));
        assert_eq!(Hash::of_bytes(b"segment"), Hash::of_bytes(b"segment"));
    }

    #[test]
    fn distinct_inputs_usually_hash_differently() {
        assert_ne!(Hash::of_id(1), Hash::of_id(2));
    }

    #[test]
    fn self_distance_is_zero_and_fully_shared() {
        let h = Hash::of_id(7);
        assert_eq!(h.xor(h), 0);
        assert_eq!(h.shared_upper_bits(h), HASH_BITS);
    }

    #[test]
    fn shared_upper_bits_matches_leading_zeros_of_xor() {
        let a = Hash { value: 0b1010_0000 << 56 };
        let b = Hash { value: 0b1010_0001 << 56 };
        assert_eq!(a.shared_upper_bits(b), 7);
    }

    #[quickcheck_macros::quickcheck]
    fn xor_distance_is_symmetric(a: u64, b: u64) -> bool {
        let ha = Hash::of_id(a);
        let hb = Hash::of_id(b);
        ha.xor(hb) == hb.xor(ha)
    }

    #[quickcheck_macros::quickcheck]
    fn shared_upper_bits_never_exceeds_width(a: u64, b: u64) -> bool {
        Hash::of_id(a).shared_upper_bits(Hash::of_id(b)) <= HASH_BITS
    }
}
