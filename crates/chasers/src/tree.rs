use rbit_primitives::{BlockHash, ChainState, SealedHeader};
use std::{collections::HashMap, sync::Arc};

/// A header that is valid but not (currently) part of the candidate chain,
/// with its rolled state.
#[derive(Debug, Clone)]
pub(crate) struct TreeNode {
    pub(crate) header: Arc<SealedHeader>,
    pub(crate) state: Arc<ChainState>,
}

/// Weak branches and look-aheads, keyed by header hash.
///
/// Every entry's `previous_hash` resolves either to another tree entry or to
/// an archived header; parents are lookup keys, not owning references, so no
/// cycles can arise and each header has exactly one owner at a time.
#[derive(Debug, Default)]
pub(crate) struct HeaderTree {
    nodes: HashMap<BlockHash, TreeNode>,
}

impl HeaderTree {
    pub(crate) fn contains(&self, hash: &BlockHash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub(crate) fn get(&self, hash: &BlockHash) -> Option<&TreeNode> {
        self.nodes.get(hash)
    }

    pub(crate) fn insert(&mut self, header: Arc<SealedHeader>, state: Arc<ChainState>) {
        self.nodes.insert(header.hash(), TreeNode { header, state });
    }

    /// Removes and returns a node, transferring ownership to the caller.
    pub(crate) fn extract(&mut self, hash: &BlockHash) -> Option<TreeNode> {
        self.nodes.remove(hash)
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
