//! An in-memory [`Archive`] implementation.

use crate::archive::{Archive, BlockState, DownloadEntry, DownloadMap, Link};
use parking_lot::Mutex;
use rbit_primitives::{
    BlockHash, BlockNumber, ChainParams, ChainState, Context, SealedBlock, SealedHeader,
};
use std::{collections::HashMap, sync::Arc};

#[derive(Debug)]
struct Stored {
    header: Arc<SealedHeader>,
    context: Context,
    parent: Link,
    block: Option<Arc<SealedBlock>>,
    state: BlockState,
    malleable: bool,
    txs_connected: bool,
}

#[derive(Debug, Default)]
struct Store {
    entries: Vec<Stored>,
    by_hash: HashMap<BlockHash, Link>,
    candidate: Vec<Link>,
    confirmed: Vec<Link>,
    // fault injection
    fail_set_link: bool,
    push_candidate_budget: Option<usize>,
    populate_fails: bool,
}

/// An in-memory archive with the indexes the pipeline needs, plus fault
/// injection for store-integrity paths.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    store: Mutex<Store>,
}

impl MemoryArchive {
    /// Creates an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an archive seeded with a genesis header on both chains.
    pub fn with_genesis(genesis: Arc<SealedHeader>, context: Context) -> Self {
        let archive = Self::new();
        let link = archive.set_header_link(genesis, context);
        assert!(archive.push_candidate(link));
        assert!(archive.push_confirmed(link));
        archive
    }

    /// Makes the next `set_header_link`/`set_block_link` return terminal.
    pub fn fail_next_set_link(&self) {
        self.store.lock().fail_set_link = true;
    }

    /// Allows `budget` further successful `push_candidate` calls, then fails.
    pub fn fail_push_candidate_after(&self, budget: usize) {
        self.store.lock().push_candidate_budget = Some(budget);
    }

    /// Makes `populate` fail.
    pub fn fail_populate(&self) {
        self.store.lock().populate_fails = true;
    }

    /// Marks a stored block malleable (test scaffolding for re-download
    /// scenarios).
    pub fn set_malleable(&self, link: Link) {
        let mut store = self.store.lock();
        let entry = store.entry_mut(link).expect("link exists");
        entry.malleable = true;
    }

    /// The candidate chain hashes, genesis first.
    pub fn candidate_chain(&self) -> Vec<BlockHash> {
        let store = self.store.lock();
        store.candidate.iter().map(|link| store.entry(*link).unwrap().header.hash()).collect()
    }
}

impl Store {
    fn entry(&self, link: Link) -> Option<&Stored> {
        self.entries.get(usize::try_from(link.value()).ok()?)
    }

    fn entry_mut(&mut self, link: Link) -> Option<&mut Stored> {
        self.entries.get_mut(usize::try_from(link.value()).ok()?)
    }

    fn candidate_height_of(&self, link: Link) -> Option<BlockNumber> {
        self.candidate.iter().position(|l| *l == link).map(|h| h as BlockNumber)
    }

    fn downloadable(&self, link: Link) -> bool {
        // Malleated blocks read as unassociated so a re-download is solicited.
        self.entry(link).is_some_and(|e| e.block.is_some() && !e.malleable)
    }
}

impl Archive for MemoryArchive {
    fn to_header(&self, hash: &BlockHash) -> Link {
        self.store.lock().by_hash.get(hash).copied().unwrap_or_default()
    }

    fn get_height(&self, link: Link) -> Option<BlockNumber> {
        let store = self.store.lock();
        Some(store.entry(link)?.context.height)
    }

    fn to_parent(&self, link: Link) -> Link {
        self.store.lock().entry(link).map(|e| e.parent).unwrap_or_default()
    }

    fn to_candidate(&self, height: BlockNumber) -> Link {
        let store = self.store.lock();
        store.candidate.get(height as usize).copied().unwrap_or_default()
    }

    fn to_confirmed(&self, height: BlockNumber) -> Link {
        let store = self.store.lock();
        store.confirmed.get(height as usize).copied().unwrap_or_default()
    }

    fn get_top_candidate(&self) -> BlockNumber {
        self.store.lock().candidate.len().saturating_sub(1) as BlockNumber
    }

    fn get_top_confirmed(&self) -> BlockNumber {
        self.store.lock().confirmed.len().saturating_sub(1) as BlockNumber
    }

    fn get_fork(&self) -> BlockNumber {
        let store = self.store.lock();
        let mut fork = 0;
        for height in 0..store.candidate.len().min(store.confirmed.len()) {
            if store.candidate[height] != store.confirmed[height] {
                break
            }
            fork = height;
        }
        fork as BlockNumber
    }

    fn get_bits(&self, link: Link) -> Option<u32> {
        let store = self.store.lock();
        Some(store.entry(link)?.header.bits)
    }

    fn get_header(&self, link: Link) -> Option<Arc<SealedHeader>> {
        let store = self.store.lock();
        Some(store.entry(link)?.header.clone())
    }

    fn get_candidate_hashes(&self, heights: &[BlockNumber]) -> Vec<BlockHash> {
        let store = self.store.lock();
        heights
            .iter()
            .filter_map(|height| {
                let link = store.candidate.get(*height as usize)?;
                Some(store.entry(*link)?.header.hash())
            })
            .collect()
    }

    fn get_confirmed_hashes(&self, heights: &[BlockNumber]) -> Vec<BlockHash> {
        let store = self.store.lock();
        heights
            .iter()
            .filter_map(|height| {
                let link = store.confirmed.get(*height as usize)?;
                Some(store.entry(*link)?.header.hash())
            })
            .collect()
    }

    fn get_candidate_chain_state(
        &self,
        params: &ChainParams,
        height: BlockNumber,
    ) -> Option<ChainState> {
        let store = self.store.lock();
        let top = *store.candidate.get(height as usize)?;
        let hash = store.entry(top)?.header.hash();

        let mut work = rbit_primitives::Work::zero();
        let mut timestamps = Vec::new();
        for h in 0..=height {
            let entry = store.entry(*store.candidate.get(h as usize)?)?;
            work += entry.header.proof();
            timestamps.push(entry.header.timestamp);
        }
        let window = timestamps.len().saturating_sub(11);
        Some(ChainState::from_parts(height, hash, work, timestamps.split_off(window), params))
    }

    fn set_header_link(&self, header: Arc<SealedHeader>, context: Context) -> Link {
        let mut store = self.store.lock();
        if store.fail_set_link {
            store.fail_set_link = false;
            return Link::TERMINAL
        }
        let hash = header.hash();
        if let Some(existing) = store.by_hash.get(&hash) {
            return *existing
        }
        let parent = store.by_hash.get(&header.previous_hash).copied().unwrap_or_default();
        let link = Link::new(store.entries.len() as u64);
        store.entries.push(Stored {
            header,
            context,
            parent,
            block: None,
            state: BlockState::Unknown,
            malleable: false,
            txs_connected: false,
        });
        store.by_hash.insert(hash, link);
        link
    }

    fn set_block_link(&self, block: Arc<SealedBlock>) -> Link {
        let mut store = self.store.lock();
        if store.fail_set_link {
            store.fail_set_link = false;
            return Link::TERMINAL
        }
        let hash = block.hash();
        let Some(link) = store.by_hash.get(&hash).copied() else { return Link::TERMINAL };
        let entry = store.entry_mut(link).expect("indexed link exists");
        let distinct = entry
            .block
            .as_ref()
            .is_some_and(|existing| existing.transactions() != block.transactions());
        entry.block = Some(block);
        if distinct {
            // A distinct body for an already-linked header: malleation on
            // first sight, supersession on re-download.
            entry.malleable = !entry.malleable;
            entry.state = BlockState::Unknown;
        }
        link
    }

    fn push_candidate(&self, link: Link) -> bool {
        let mut store = self.store.lock();
        if let Some(budget) = store.push_candidate_budget.as_mut() {
            if *budget == 0 {
                return false
            }
            *budget -= 1;
        }
        if store.entry(link).is_none() {
            return false
        }
        store.candidate.push(link);
        true
    }

    fn pop_candidate(&self) -> bool {
        self.store.lock().candidate.pop().is_some()
    }

    fn push_confirmed(&self, link: Link) -> bool {
        let mut store = self.store.lock();
        if store.entry(link).is_none() {
            return false
        }
        store.confirmed.push(link);
        true
    }

    fn set_block_unconfirmable(&self, link: Link) -> bool {
        let mut store = self.store.lock();
        let Some(entry) = store.entry_mut(link) else { return false };
        entry.state = BlockState::Unconfirmable;
        true
    }

    fn set_block_preconfirmable(&self, link: Link) -> bool {
        let mut store = self.store.lock();
        let Some(entry) = store.entry_mut(link) else { return false };
        entry.state = BlockState::Preconfirmable;
        true
    }

    fn set_block_confirmable(&self, link: Link) -> bool {
        let mut store = self.store.lock();
        let Some(entry) = store.entry_mut(link) else { return false };
        entry.state = BlockState::Confirmable;
        true
    }

    fn set_txs_connected(&self, link: Link) -> bool {
        let mut store = self.store.lock();
        let Some(entry) = store.entry_mut(link) else { return false };
        entry.txs_connected = true;
        true
    }

    fn get_block_state(&self, link: Link) -> BlockState {
        self.store.lock().entry(link).map(|e| e.state).unwrap_or_default()
    }

    fn is_header(&self, hash: &BlockHash) -> bool {
        self.store.lock().by_hash.contains_key(hash)
    }

    fn is_block(&self, hash: &BlockHash) -> bool {
        let store = self.store.lock();
        store.by_hash.get(hash).is_some_and(|link| {
            store.entry(*link).is_some_and(|e| e.block.is_some())
        })
    }

    fn is_candidate_header(&self, link: Link) -> bool {
        self.store.lock().candidate_height_of(link).is_some()
    }

    fn is_associated(&self, link: Link) -> bool {
        self.store.lock().entry(link).is_some_and(|e| e.block.is_some())
    }

    fn is_malleable(&self, link: Link) -> bool {
        self.store.lock().entry(link).is_some_and(|e| e.malleable)
    }

    fn get_unassociated_above(&self, start: BlockNumber, count: usize) -> DownloadMap {
        let store = self.store.lock();
        let mut map = DownloadMap::new();
        let top = store.candidate.len().saturating_sub(1) as BlockNumber;
        let mut height = start + 1;
        while height <= top && map.len() < count {
            let link = store.candidate[height as usize];
            if !store.downloadable(link) {
                let entry = store.entry(link).expect("candidate link exists");
                map.insert(
                    height,
                    DownloadEntry { hash: entry.header.hash(), context: entry.context },
                );
            }
            height += 1;
        }
        map
    }

    fn get_last_associated_from(&self, height: BlockNumber) -> BlockNumber {
        let store = self.store.lock();
        let top = store.candidate.len().saturating_sub(1) as BlockNumber;
        let mut last = height;
        while last < top && store.downloadable(store.candidate[(last + 1) as usize]) {
            last += 1;
        }
        last
    }

    fn populate(&self, _block: &SealedBlock) -> bool {
        !self.store.lock().populate_fails
    }

    fn get_block(&self, link: Link) -> Option<Arc<SealedBlock>> {
        self.store.lock().entry(link)?.block.clone()
    }

    fn get_context(&self, link: Link) -> Option<Context> {
        Some(self.store.lock().entry(link)?.context)
    }
}
