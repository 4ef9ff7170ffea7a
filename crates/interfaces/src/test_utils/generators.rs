//! Deterministic chain generators.

use crate::archive::Archive;
use rbit_primitives::{
    Block, BlockHash, ChainParams, ChainState, Header, OutPoint, SealedBlock, SealedHeader,
    Transaction, TxInput, TxOutput,
};
use std::sync::Arc;

/// Compact bits giving every generated header a small equal proof.
pub const EASY_BITS: u32 = 0x207fffff;

/// Compact bits giving a strictly larger per-header proof than [`EASY_BITS`].
pub const HARD_BITS: u32 = 0x1f7fffff;

/// A deterministic genesis header.
pub fn genesis() -> SealedHeader {
    Header {
        version: 1,
        previous_hash: BlockHash::zero(),
        merkle_root: BlockHash::zero(),
        timestamp: 1_000,
        bits: EASY_BITS,
        nonce: 0,
    }
    .seal()
}

/// A child header of `parent` with the given bits; `salt` perturbs the nonce
/// so siblings hash distinctly.
pub fn child_with(parent: &SealedHeader, bits: u32, salt: u32) -> SealedHeader {
    Header {
        version: 1,
        previous_hash: parent.hash(),
        merkle_root: BlockHash::zero(),
        timestamp: parent.timestamp + 10,
        bits,
        nonce: salt,
    }
    .seal()
}

/// A child header of `parent` with default bits.
pub fn child(parent: &SealedHeader) -> SealedHeader {
    child_with(parent, EASY_BITS, 0)
}

/// A chain of `len` headers extending `parent`, oldest first.
pub fn chain(parent: &SealedHeader, len: usize) -> Vec<SealedHeader> {
    chain_with(parent, len, EASY_BITS)
}

/// A chain of `len` headers extending `parent` with the given bits.
pub fn chain_with(parent: &SealedHeader, len: usize, bits: u32) -> Vec<SealedHeader> {
    let mut out = Vec::with_capacity(len);
    let mut previous = parent.clone();
    for _ in 0..len {
        let next = child_with(&previous, bits, 0);
        out.push(next.clone());
        previous = next;
    }
    out
}

/// A minimal block body for a header: a single coinbase transaction.
pub fn block_for(header: &SealedHeader) -> SealedBlock {
    block_with_salt(header, 0)
}

/// A block body for a header with a salted coinbase, so two bodies for the
/// same header differ.
pub fn block_with_salt(header: &SealedHeader, salt: u64) -> SealedBlock {
    Block {
        header: header.header().clone(),
        transactions: vec![Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint { hash: BlockHash::zero(), index: u32::MAX },
                script: salt.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput { value: 50 * 100_000_000, script: vec![0x51] }],
            locktime: 0,
        }],
    }
    .seal()
}

/// Stores `headers` (oldest first, extending the archive's candidate top)
/// and pushes each onto the candidate chain. Returns the rolled states.
pub fn seed_candidates<A: Archive>(
    archive: &A,
    params: &ChainParams,
    mut state: ChainState,
    headers: &[SealedHeader],
) -> Vec<ChainState> {
    let mut states = Vec::with_capacity(headers.len());
    for header in headers {
        state = state.roll(header, params);
        let link = archive.set_header_link(Arc::new(header.clone()), state.context());
        assert!(!link.is_terminal());
        assert!(archive.push_candidate(link));
        states.push(state.clone());
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_link_and_hash_distinctly() {
        let genesis = genesis();
        let headers = chain(&genesis, 5);
        assert_eq!(headers.len(), 5);
        assert_eq!(headers[0].previous_hash, genesis.hash());
        for pair in headers.windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].hash());
            assert_ne!(pair[1].hash(), pair[0].hash());
        }
    }

    #[test]
    fn hard_bits_outwork_easy_bits() {
        assert!(Header::proof_of(HARD_BITS) > Header::proof_of(EASY_BITS));
    }

    #[test]
    fn salted_siblings_differ() {
        let genesis = genesis();
        let a = child_with(&genesis, EASY_BITS, 1);
        let b = child_with(&genesis, EASY_BITS, 2);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.previous_hash, b.previous_hash);
    }

    #[test]
    fn salted_bodies_share_header_hash() {
        let header = genesis();
        let a = block_with_salt(&header, 1);
        let b = block_with_salt(&header, 2);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.transactions(), b.transactions());
    }
}
