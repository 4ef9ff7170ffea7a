use crate::{BlockHash, Work};
use derive_more::{AsRef, Deref};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A Bitcoin block header.
///
/// The `hash` is not a field; it is derived by double SHA-256 over the 80-byte
/// serialization and memoized by sealing the header into a [`SealedHeader`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    /// Block version, signals which validation rules the miner asserts.
    pub version: u32,
    /// Hash of the parent block header.
    pub previous_hash: BlockHash,
    /// Root of the transaction merkle tree.
    pub merkle_root: BlockHash,
    /// Unix timestamp claimed by the miner.
    pub timestamp: u32,
    /// Compact encoding of the proof-of-work target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl Header {
    /// Serializes the header into its canonical 80-byte wire form.
    pub fn to_bytes(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Computes the header hash (double SHA-256 of the 80-byte serialization).
    ///
    /// This is expensive; prefer [`Header::seal`] so the hash is computed once.
    pub fn hash_slow(&self) -> BlockHash {
        sha256d(&self.to_bytes())
    }

    /// Seals the header, memoizing its hash.
    pub fn seal(self) -> SealedHeader {
        let hash = self.hash_slow();
        SealedHeader::new(self, hash)
    }

    /// The numeric work this header contributes to its branch.
    ///
    /// Defined as `2^256 / (target + 1)`, evaluated without overflow as
    /// `(!target / (target + 1)) + 1`.
    pub fn proof(&self) -> Work {
        Self::proof_of(self.bits)
    }

    /// The work contribution implied by a compact `bits` value.
    pub fn proof_of(bits: u32) -> Work {
        let target = decode_compact(bits);
        if target.is_zero() {
            return Work::zero()
        }
        (!target / (target + Work::one())) + Work::one()
    }
}

/// Decodes a compact `bits` value into the full 256-bit target.
///
/// An overflowing or negative compact value decodes to zero, which in turn
/// yields zero proof, so such headers never contribute work.
pub fn decode_compact(bits: u32) -> Work {
    let size = (bits >> 24) as usize;
    let word = bits & 0x007f_ffff;

    // Sign bit set encodes a negative target.
    if bits & 0x0080_0000 != 0 {
        return Work::zero()
    }

    if size <= 3 {
        Work::from(word >> (8 * (3 - size)))
    } else if size > 34 || (size == 34 && word > 0xff) || (size == 33 && word > 0xffff) {
        // Would overflow 256 bits.
        Work::zero()
    } else {
        Work::from(word) << (8 * (size - 3))
    }
}

/// Double SHA-256.
pub(crate) fn sha256d(data: &[u8]) -> BlockHash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    BlockHash::from_slice(&second)
}

/// A [`Header`] sealed at a precalculated hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, AsRef, Deref, Serialize, Deserialize)]
pub struct SealedHeader {
    /// Locked header hash.
    hash: BlockHash,
    /// Locked header fields.
    #[as_ref]
    #[deref]
    header: Header,
}

impl SealedHeader {
    /// Creates the sealed header from a header and its precalculated hash.
    #[inline]
    pub const fn new(header: Header, hash: BlockHash) -> Self {
        Self { header, hash }
    }

    /// Returns the sealed header fields.
    #[inline]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the memoized header hash.
    #[inline]
    pub const fn hash(&self) -> BlockHash {
        self.hash
    }

    /// Extracts the raw header, discarding the hash.
    pub fn unseal(self) -> Header {
        self.header
    }

    /// Splits into the raw header and its hash.
    pub fn split(self) -> (Header, BlockHash) {
        (self.header, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_hash_matches_slow_hash() {
        let header = Header { version: 2, timestamp: 1_500_000_000, bits: 0x1d00ffff, ..Default::default() };
        let sealed = header.clone().seal();
        assert_eq!(sealed.hash(), header.hash_slow());
        assert_eq!(sealed.header(), &header);
    }

    #[test]
    fn compact_round_numbers() {
        // Mainnet genesis target.
        let target = decode_compact(0x1d00ffff);
        assert_eq!(target, Work::from(0xffffu64) << (8 * (0x1d - 3)));

        // Small sizes shift right.
        assert_eq!(decode_compact(0x03123456), Work::from(0x123456u64));
        assert_eq!(decode_compact(0x02123456), Work::from(0x1234u64));
        assert_eq!(decode_compact(0x01123456), Work::from(0x12u64));
    }

    #[test]
    fn compact_negative_or_overflow_is_zero() {
        assert!(decode_compact(0x04923456).is_zero(), "sign bit");
        assert!(decode_compact(0xff123456).is_zero(), "overflow");
    }

    #[test]
    fn proof_is_monotonic_in_difficulty() {
        // A lower target (harder) must contribute strictly more work.
        let easy = Header::proof_of(0x1d00ffff);
        let hard = Header::proof_of(0x1c00ffff);
        assert!(hard > easy);
        assert!(!easy.is_zero());
    }

    #[test]
    fn zero_target_contributes_no_work() {
        assert!(Header::proof_of(0).is_zero());
    }
}
