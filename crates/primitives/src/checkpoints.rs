use crate::{BlockHash, BlockNumber};
use serde::{Deserialize, Serialize};

/// A hardcoded `(height, hash)` pair the stored chain must match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The checkpointed height.
    pub height: BlockNumber,
    /// The required hash at that height.
    pub hash: BlockHash,
}

impl Checkpoint {
    /// Creates a checkpoint.
    pub const fn new(height: BlockNumber, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// Returns true if the pair matches this checkpoint exactly.
    pub fn equals(&self, hash: &BlockHash, height: BlockNumber) -> bool {
        self.height == height && self.hash == *hash
    }

    /// Returns true if `hash` at `height` conflicts with any checkpoint.
    ///
    /// A conflict is a checkpointed height carrying a different hash.
    pub fn is_conflict(checkpoints: &[Checkpoint], hash: &BlockHash, height: BlockNumber) -> bool {
        checkpoints.iter().any(|cp| cp.height == height && cp.hash != *hash)
    }

    /// Returns true if `height` is exactly a checkpointed height.
    pub fn is_at(checkpoints: &[Checkpoint], height: BlockNumber) -> bool {
        checkpoints.iter().any(|cp| cp.height == height)
    }

    /// Returns true if `height` is at or below the highest checkpoint.
    pub fn is_under(checkpoints: &[Checkpoint], height: BlockNumber) -> bool {
        checkpoints.iter().map(|cp| cp.height).max().is_some_and(|top| height <= top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(height: BlockNumber, byte: u8) -> Checkpoint {
        Checkpoint::new(height, BlockHash::repeat_byte(byte))
    }

    #[test]
    fn conflict_requires_same_height_different_hash() {
        let checkpoints = [cp(10, 0xaa), cp(20, 0xbb)];
        assert!(Checkpoint::is_conflict(&checkpoints, &BlockHash::repeat_byte(0xcc), 10));
        assert!(!Checkpoint::is_conflict(&checkpoints, &BlockHash::repeat_byte(0xaa), 10));
        assert!(!Checkpoint::is_conflict(&checkpoints, &BlockHash::repeat_byte(0xcc), 15));
    }

    #[test]
    fn under_is_inclusive_of_top() {
        let checkpoints = [cp(10, 0xaa), cp(20, 0xbb)];
        assert!(Checkpoint::is_under(&checkpoints, 20));
        assert!(Checkpoint::is_under(&checkpoints, 5));
        assert!(!Checkpoint::is_under(&checkpoints, 21));
        assert!(!Checkpoint::is_under(&[], 0));
    }
}
