//! The archive/query interface consumed by the pipeline.
//!
//! The archive is the only shared mutable resource in the system. It is
//! externally thread-safe and passed by [`std::sync::Arc`] into every
//! component; the pipeline never assumes anything about its storage format.

use rbit_primitives::{
    BlockHash, BlockNumber, ChainParams, ChainState, Context, SealedBlock, SealedHeader,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// Opaque integer-valued handle into the archive for a stored header or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Link(u64);

impl Link {
    /// Sentinel denoting absence.
    pub const TERMINAL: Self = Self(u64::MAX);

    /// Creates a link from its raw archive value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw archive value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns true for the terminal sentinel.
    pub const fn is_terminal(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::TERMINAL
    }
}

/// Stored validation state of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockState {
    /// No validation outcome recorded.
    #[default]
    Unknown,
    /// Accept+connect passed at the associated candidate height.
    Preconfirmable,
    /// Fully confirmed at the associated height.
    Confirmable,
    /// Known invalid; never promote.
    Unconfirmable,
}

/// One unassociated candidate height with its expected hash and stored
/// context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEntry {
    /// Expected header hash at the height.
    pub hash: BlockHash,
    /// Stored validation context for the height.
    pub context: Context,
}

/// An ordered, height-tagged set of unassociated candidate heights: the unit
/// of download work handed to a channel.
///
/// A map is owned by at most one channel at a time; returning it (stop,
/// split, purge) transfers ownership back to the check chaser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadMap {
    by_height: BTreeMap<BlockNumber, DownloadEntry>,
    by_hash: HashMap<BlockHash, BlockNumber>,
}

impl DownloadMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry at a height.
    pub fn insert(&mut self, height: BlockNumber, entry: DownloadEntry) {
        self.by_hash.insert(entry.hash, height);
        self.by_height.insert(height, entry);
    }

    /// Number of outstanding heights.
    pub fn len(&self) -> usize {
        self.by_height.len()
    }

    /// Returns true if no heights remain.
    pub fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }

    /// Returns true if `hash` is expected by this map.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Looks up the height and entry for an expected hash.
    pub fn get(&self, hash: &BlockHash) -> Option<(BlockNumber, &DownloadEntry)> {
        let height = *self.by_hash.get(hash)?;
        Some((height, self.by_height.get(&height)?))
    }

    /// Removes an expected hash, returning its height and entry.
    pub fn remove(&mut self, hash: &BlockHash) -> Option<(BlockNumber, DownloadEntry)> {
        let height = self.by_hash.remove(hash)?;
        let entry = self.by_height.remove(&height)?;
        Some((height, entry))
    }

    /// The highest tagged height, if any.
    pub fn top(&self) -> Option<BlockNumber> {
        self.by_height.keys().next_back().copied()
    }

    /// The lowest tagged height, if any.
    pub fn bottom(&self) -> Option<BlockNumber> {
        self.by_height.keys().next().copied()
    }

    /// Splits off the upper half of the map, leaving the lower half in place.
    ///
    /// The donor keeps the front (lower) heights; the returned map holds the
    /// tail.
    pub fn split_tail(&mut self) -> DownloadMap {
        let keep = self.len().div_ceil(2);
        let Some(split_at) = self.by_height.keys().nth(keep).copied() else {
            return DownloadMap::new()
        };
        let tail = self.by_height.split_off(&split_at);
        let mut out = DownloadMap::new();
        for (height, entry) in tail {
            self.by_hash.remove(&entry.hash);
            out.insert(height, entry);
        }
        out
    }

    /// Iterates entries in height order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockNumber, &DownloadEntry)> + '_ {
        self.by_height.iter().map(|(height, entry)| (*height, entry))
    }

    /// The expected hashes in height order.
    pub fn hashes(&self) -> impl Iterator<Item = BlockHash> + '_ {
        self.by_height.values().map(|entry| entry.hash)
    }

    /// The tagged heights in order.
    pub fn heights(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.by_height.keys().copied()
    }
}

/// The archive/query engine consumed by the pipeline.
///
/// All operations are synchronous; the engine is externally synchronized.
/// Write operations signal storage faults by returning `false` (or a
/// terminal [`Link`]), which the pipeline treats as fatal `store_integrity`.
#[auto_impl::auto_impl(&, Arc)]
pub trait Archive: Send + Sync + 'static {
    /// Resolves a header hash to its link, terminal if absent.
    fn to_header(&self, hash: &BlockHash) -> Link;

    /// Height of a stored header.
    fn get_height(&self, link: Link) -> Option<BlockNumber>;

    /// Link of a stored header's parent, terminal for genesis or absent.
    fn to_parent(&self, link: Link) -> Link;

    /// Link of the candidate header at a height, terminal if none.
    fn to_candidate(&self, height: BlockNumber) -> Link;

    /// Link of the confirmed header at a height, terminal if none.
    fn to_confirmed(&self, height: BlockNumber) -> Link;

    /// Height of the candidate top.
    fn get_top_candidate(&self) -> BlockNumber;

    /// Height of the confirmed top.
    fn get_top_confirmed(&self) -> BlockNumber;

    /// Height at which the candidate and confirmed chains diverge.
    fn get_fork(&self) -> BlockNumber;

    /// Compact target bits of a stored header.
    fn get_bits(&self, link: Link) -> Option<u32>;

    /// A stored header by link.
    fn get_header(&self, link: Link) -> Option<Arc<SealedHeader>>;

    /// Candidate-chain hashes at the given heights, skipping absences.
    fn get_candidate_hashes(&self, heights: &[BlockNumber]) -> Vec<BlockHash>;

    /// Confirmed-chain hashes at the given heights, skipping absences.
    fn get_confirmed_hashes(&self, heights: &[BlockNumber]) -> Vec<BlockHash>;

    /// Rebuilds the rolling chain state of the candidate header at `height`.
    ///
    /// This walks stored data and is expensive; callers cache the result.
    fn get_candidate_chain_state(
        &self,
        params: &ChainParams,
        height: BlockNumber,
    ) -> Option<ChainState>;

    /// Stores a header with its validation context. Terminal on failure;
    /// re-storing an existing header returns its existing link.
    fn set_header_link(&self, header: Arc<SealedHeader>, context: Context) -> Link;

    /// Associates a block body with its stored header, storing transactions.
    /// Terminal on failure. Associating a distinct body to an
    /// already-associated header marks the entry malleable.
    fn set_block_link(&self, block: Arc<SealedBlock>) -> Link;

    /// Appends a stored header to the candidate chain.
    #[must_use]
    fn push_candidate(&self, link: Link) -> bool;

    /// Removes the candidate top.
    #[must_use]
    fn pop_candidate(&self) -> bool;

    /// Appends a stored header to the confirmed chain.
    #[must_use]
    fn push_confirmed(&self, link: Link) -> bool;

    /// Marks a block invalid for confirmation.
    #[must_use]
    fn set_block_unconfirmable(&self, link: Link) -> bool;

    /// Marks a block accept+connect validated.
    #[must_use]
    fn set_block_preconfirmable(&self, link: Link) -> bool;

    /// Marks a block fully confirmable.
    #[must_use]
    fn set_block_confirmable(&self, link: Link) -> bool;

    /// Marks a block's transactions connected (performance accounting).
    #[must_use]
    fn set_txs_connected(&self, link: Link) -> bool;

    /// Stored validation state of a block.
    fn get_block_state(&self, link: Link) -> BlockState;

    /// Returns true if the hash resolves to a stored header.
    fn is_header(&self, hash: &BlockHash) -> bool;

    /// Returns true if the hash resolves to an associated block.
    fn is_block(&self, hash: &BlockHash) -> bool;

    /// Returns true if the link lies on the candidate chain.
    fn is_candidate_header(&self, link: Link) -> bool;

    /// Returns true if the header has an associated block body.
    fn is_associated(&self, link: Link) -> bool;

    /// Returns true if the stored block admits a distinct equally-linking
    /// variant.
    fn is_malleable(&self, link: Link) -> bool;

    /// Collects up to `count` unassociated candidate heights strictly above
    /// `start`, with expected hashes and stored contexts.
    fn get_unassociated_above(&self, start: BlockNumber, count: usize) -> DownloadMap;

    /// The highest associated candidate height in the run starting above
    /// `height`.
    fn get_last_associated_from(&self, height: BlockNumber) -> BlockNumber;

    /// Resolves previous outputs for a block's inputs.
    #[must_use]
    fn populate(&self, block: &SealedBlock) -> bool;

    /// A stored block body by header link.
    fn get_block(&self, link: Link) -> Option<Arc<SealedBlock>>;

    /// Stored validation context of a header.
    fn get_context(&self, link: Link) -> Option<Context>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> DownloadEntry {
        DownloadEntry { hash: BlockHash::repeat_byte(byte), context: Context::default() }
    }

    #[test]
    fn terminal_sentinel() {
        assert!(Link::TERMINAL.is_terminal());
        assert!(!Link::new(0).is_terminal());
        assert!(Link::default().is_terminal());
    }

    #[test]
    fn download_map_indexes_by_hash_and_height() {
        let mut map = DownloadMap::new();
        map.insert(5, entry(5));
        map.insert(6, entry(6));

        assert_eq!(map.len(), 2);
        assert_eq!(map.top(), Some(6));
        assert_eq!(map.bottom(), Some(5));
        assert!(map.contains(&BlockHash::repeat_byte(5)));

        let (height, removed) = map.remove(&BlockHash::repeat_byte(5)).unwrap();
        assert_eq!(height, 5);
        assert_eq!(removed.hash, BlockHash::repeat_byte(5));
        assert!(!map.contains(&BlockHash::repeat_byte(5)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn split_tail_keeps_front_half() {
        let mut map = DownloadMap::new();
        for height in 0..10u64 {
            map.insert(height, entry(height as u8));
        }

        let tail = map.split_tail();
        assert_eq!(map.len(), 5);
        assert_eq!(tail.len(), 5);
        assert_eq!(map.top(), Some(4));
        assert_eq!(tail.bottom(), Some(5));
        // Hash index follows the split.
        assert!(!map.contains(&BlockHash::repeat_byte(7)));
        assert!(tail.contains(&BlockHash::repeat_byte(7)));
    }

    #[test]
    fn split_tail_of_odd_map_favors_donor() {
        let mut map = DownloadMap::new();
        for height in 0..5u64 {
            map.insert(height, entry(height as u8));
        }
        let tail = map.split_tail();
        assert_eq!(map.len(), 3);
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn split_tail_of_empty_is_empty() {
        let mut map = DownloadMap::new();
        assert!(map.split_tail().is_empty());
    }
}
