//! Header acceptance, candidate-chain organization and reorganization.

use crate::{events::EventBus, tree::HeaderTree};
use rbit_interfaces::{
    archive::{Archive, BlockState, Link},
    consensus::Consensus,
    error::NodeError,
    events::Chase,
};
use rbit_primitives::{
    BlockHash, BlockNumber, ChainParams, ChainState, Checkpoint, Header, SealedHeader, Work,
};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Accepts headers, places them in the tree or promotes them, and
/// reorganizes the candidate chain when a competing branch gains more work.
///
/// Runs on the node task only. The header tree plus the archive form a DAG
/// with weak branches; each header is owned either by the tree or by the
/// archive, never both.
#[derive(Debug)]
pub struct HeaderOrganizer<A, C> {
    archive: Arc<A>,
    consensus: Arc<C>,
    params: ChainParams,
    events: EventBus,
    tree: HeaderTree,
    /// Hot snapshot of the candidate-top chain state.
    top_state: Option<Arc<ChainState>>,
}

impl<A: Archive, C: Consensus> HeaderOrganizer<A, C> {
    /// Creates an organizer over the archive and consensus predicates.
    pub fn new(archive: Arc<A>, consensus: Arc<C>, params: ChainParams, events: EventBus) -> Self {
        Self { archive, consensus, params, events, tree: HeaderTree::default(), top_state: None }
    }

    /// Initializes the candidate-top state cache.
    ///
    /// Spans the stored chain to obtain cumulative work; this is the one
    /// expected expensive scan.
    pub fn start(&mut self) -> Result<(), NodeError> {
        let top = self.archive.get_top_candidate();
        self.top_state = self
            .archive
            .get_candidate_chain_state(&self.params, top)
            .map(Arc::new)
            .ok_or(NodeError::StoreIntegrity)?
            .into();
        Ok(())
    }

    /// Number of cached tree headers.
    pub fn tree_len(&self) -> usize {
        self.tree.len()
    }

    /// Reacts to bus events: drops the tree on stop, disorganizes on
    /// invalidation.
    pub fn handle_event(&mut self, event: Chase) -> Result<(), NodeError> {
        match event {
            Chase::Stop => {
                self.tree.clear();
                Ok(())
            }
            Chase::Unchecked { link } |
            Chase::Unpreconfirmable { link } |
            Chase::Unconfirmable { link } => self.disorganize(link),
            _ => Ok(()),
        }
    }

    /// Accepts one header: validates it, then caches it in the tree or
    /// stores it, reorganizing the candidate chain if its branch is strong.
    ///
    /// Returns the header's height. `now_seconds` is the wall clock for the
    /// currency test.
    pub fn organize(
        &mut self,
        header: Arc<SealedHeader>,
        now_seconds: u64,
    ) -> Result<BlockNumber, NodeError> {
        let hash = header.hash();

        // Skip existing/orphan, get state.
        if self.tree.contains(&hash) {
            return Err(NodeError::DuplicateHeader)
        }
        let existing = self.archive.to_header(&hash);
        if !existing.is_terminal() {
            if self.archive.get_block_state(existing) == BlockState::Unconfirmable {
                let height =
                    self.archive.get_height(existing).ok_or(NodeError::StoreIntegrity)?;
                return Err(NodeError::BlockUnconfirmable { height })
            }
            return Err(NodeError::DuplicateHeader)
        }

        let parent = self.get_state(&header.previous_hash).ok_or(NodeError::OrphanHeader)?;

        // Roll chain state forward from previous to current header.
        let state = parent.roll(&header, &self.params);
        let height = state.height();
        self.log_transitions(&parent, &state);

        // Validate. Header validations are not bypassed under checkpoint or
        // milestone; checkpoints are chain, not header, validation.
        if Checkpoint::is_conflict(&self.params.checkpoints, &hash, height) {
            return Err(NodeError::CheckpointConflict { height })
        }
        self.consensus.check_header(&header, &self.params)?;
        self.consensus.accept_header(&header, &state.context())?;

        // A checkpointed or milestoned branch always gets stored. Otherwise
        // the branch must be both current and of sufficient work.
        if !Checkpoint::is_at(&self.params.checkpoints, height) &&
            !self.params.milestone.equals(&hash, height) &&
            !(self.params.is_current(header.timestamp, now_seconds) &&
                state.cumulative_work() >= self.params.minimum_work)
        {
            self.cache(header, state);
            return Ok(height)
        }

        // Compute relative work.
        let (work, branch_point, tree_branch, store_branch) = self.get_branch_work(&header)?;
        if !self.is_strong(&work, branch_point)? {
            // Header is the new top of a weak branch.
            self.cache(header, state);
            return Ok(height)
        }

        // Branch with greater work: reorganize the candidate chain.
        let mut top = self.top_state.as_ref().map(|s| s.height()).unwrap_or_default();
        if top < branch_point {
            return Err(NodeError::StoreIntegrity)
        }
        if top > branch_point {
            debug!(
                target: "chasers::organize",
                branch_point, top, "reorganizing candidate chain"
            );
            metrics::counter!("chasers.reorganizations", 1);
            self.events.publish(Chase::Regressed { branch_point });
        }

        // Pop down to the branch point.
        while top > branch_point {
            if !self.archive.pop_candidate() {
                return Err(NodeError::StoreIntegrity)
            }
            top -= 1;
        }

        // Push stored strong headers back onto the candidate chain.
        for link in store_branch.iter().rev() {
            if !self.archive.push_candidate(*link) {
                return Err(NodeError::StoreIntegrity)
            }
        }

        // Store strong tree headers and push them.
        for key in tree_branch.iter().rev() {
            self.push_tree(key)?;
        }

        // Push the new header as the candidate top.
        self.push(&header, &state)?;

        self.top_state = Some(Arc::new(state));
        self.events.publish(Chase::Header { branch_point });

        metrics::counter!("chasers.headers_organized", 1);
        metrics::gauge!("chasers.candidate_height", height as f64);
        if height % 1_000 == 0 {
            info!(target: "chasers::organize", height, "candidate chain");
        }
        trace!(target: "chasers::organize", %hash, height, "organized header");
        Ok(height)
    }

    /// Resets the candidate chain to the confirmed top after a block above
    /// the fork point was found invalid.
    ///
    /// Pops and marks everything from the offending header up, copies the
    /// surviving candidate suffix into the tree, then restores the confirmed
    /// suffix as candidate.
    pub fn disorganize(&mut self, link: Link) -> Result<(), NodeError> {
        let height = self.archive.get_height(link).ok_or(NodeError::StoreIntegrity)?;
        if self.archive.to_candidate(height) != link {
            // Stale notification; the chain has already moved.
            return Ok(())
        }

        let fork_point = self.archive.get_fork();
        let top_candidate = self.archive.get_top_candidate();
        let top_confirmed = self.archive.get_top_confirmed();
        debug!(
            target: "chasers::organize",
            height, fork_point, top_candidate, "disorganizing candidate chain"
        );

        // Mark and pop the offending header and everything above it.
        for h in (height..=top_candidate).rev() {
            let popped = self.archive.to_candidate(h);
            if !self.archive.set_block_unconfirmable(popped) || !self.archive.pop_candidate() {
                return Err(NodeError::StoreIntegrity)
            }
        }

        // Re-derive state at the fork point and copy the surviving suffix
        // into the tree so it can organize back in without re-download.
        let mut state = self
            .archive
            .get_candidate_chain_state(&self.params, fork_point)
            .ok_or(NodeError::StoreIntegrity)?;
        for h in (fork_point + 1)..height {
            let survivor = self.archive.to_candidate(h);
            let header = self.archive.get_header(survivor).ok_or(NodeError::StoreIntegrity)?;
            state = state.roll(&header, &self.params);
            self.tree.insert(header, Arc::new(state.clone()));
        }
        for _ in (fork_point + 1)..height {
            if !self.archive.pop_candidate() {
                return Err(NodeError::StoreIntegrity)
            }
        }

        // Restore the confirmed suffix onto the candidate chain.
        for h in (fork_point + 1)..=top_confirmed {
            if !self.archive.push_candidate(self.archive.to_confirmed(h)) {
                return Err(NodeError::StoreIntegrity)
            }
        }

        let top = self.archive.get_top_candidate();
        self.top_state = self
            .archive
            .get_candidate_chain_state(&self.params, top)
            .map(Arc::new)
            .ok_or(NodeError::StoreIntegrity)?
            .into();

        self.events.publish(Chase::Disorganized { top: top_confirmed });
        Ok(())
    }

    /// Resolves the chain state for a header hash: the hot top snapshot, a
    /// tree node, or the archive.
    ///
    /// The archive fallback re-derives by walking backward from the header
    /// link to a candidate ancestor; acceptable only on branch formation.
    fn get_state(&self, hash: &BlockHash) -> Option<Arc<ChainState>> {
        let top = self.top_state.as_ref()?;
        if top.hash() == *hash {
            return Some(top.clone())
        }
        if let Some(node) = self.tree.get(hash) {
            return Some(node.state.clone())
        }

        let link = self.archive.to_header(hash);
        if link.is_terminal() {
            return None
        }
        let height = self.archive.get_height(link)?;
        if self.archive.to_candidate(height) == link {
            return self.archive.get_candidate_chain_state(&self.params, height).map(Arc::new)
        }

        // Stored but off-candidate: walk back to the candidate chain.
        let mut branch = Vec::new();
        let mut cursor = link;
        while !self.archive.is_candidate_header(cursor) {
            if cursor.is_terminal() {
                return None
            }
            branch.push(self.archive.get_header(cursor)?);
            cursor = self.archive.to_parent(cursor);
        }
        let ancestor = self.archive.get_height(cursor)?;
        let mut state = self.archive.get_candidate_chain_state(&self.params, ancestor)?;
        for header in branch.iter().rev() {
            state = state.roll(header, &self.params);
        }
        Some(Arc::new(state))
    }

    /// Walks the new header's ancestry through the tree, then through stored
    /// off-candidate headers, accumulating branch work until a candidate
    /// ancestor is reached.
    ///
    /// Returns the branch work, the branch point height, the tree branch
    /// (new to old) and the stored branch (new to old).
    fn get_branch_work(
        &self,
        header: &SealedHeader,
    ) -> Result<(Work, BlockNumber, Vec<BlockHash>, Vec<Link>), NodeError> {
        let mut work = header.proof();
        let mut previous = header.previous_hash;

        let mut tree_branch = Vec::new();
        while let Some(node) = self.tree.get(&previous) {
            previous = node.header.previous_hash;
            tree_branch.push(node.header.hash());
            work += node.header.proof();
        }

        let mut store_branch = Vec::new();
        let mut link = self.archive.to_header(&previous);
        while !self.archive.is_candidate_header(link) {
            if link.is_terminal() {
                return Err(NodeError::StoreIntegrity)
            }
            let bits = self.archive.get_bits(link).ok_or(NodeError::StoreIntegrity)?;
            store_branch.push(link);
            work += Header::proof_of(bits);
            link = self.archive.to_parent(link);
        }

        let point = self.archive.get_height(link).ok_or(NodeError::StoreIntegrity)?;
        Ok((work, point, tree_branch, store_branch))
    }

    /// Accumulates candidate work above the branch point; the branch is
    /// strong only if it strictly exceeds it. A tie goes to the incumbent.
    fn is_strong(&self, work: &Work, branch_point: BlockNumber) -> Result<bool, NodeError> {
        let mut candidate_work = Work::zero();
        let mut height = self.archive.get_top_candidate();
        while height > branch_point {
            let link = self.archive.to_candidate(height);
            let bits = self.archive.get_bits(link).ok_or(NodeError::StoreIntegrity)?;
            candidate_work += Header::proof_of(bits);
            if candidate_work >= *work {
                return Ok(false)
            }
            height -= 1;
        }
        Ok(true)
    }

    fn cache(&mut self, header: Arc<SealedHeader>, state: ChainState) {
        trace!(
            target: "chasers::organize",
            hash = %header.hash(), height = state.height(), "caching weak header"
        );
        self.tree.insert(header, Arc::new(state));
    }

    /// Stores a header and pushes it onto the candidate chain.
    fn push(&self, header: &Arc<SealedHeader>, state: &ChainState) -> Result<Link, NodeError> {
        let link = self.archive.set_header_link(header.clone(), state.context());
        if link.is_terminal() || !self.archive.push_candidate(link) {
            return Err(NodeError::StoreIntegrity)
        }
        Ok(link)
    }

    /// Moves a tree node into the archive and pushes it onto the candidate
    /// chain.
    fn push_tree(&mut self, key: &BlockHash) -> Result<(), NodeError> {
        let node = self.tree.extract(key).ok_or(NodeError::StoreIntegrity)?;
        let link = self.archive.set_header_link(node.header, node.state.context());
        if link.is_terminal() || !self.archive.push_candidate(link) {
            return Err(NodeError::StoreIntegrity)
        }
        Ok(())
    }

    fn log_transitions(&self, parent: &ChainState, state: &ChainState) {
        if parent.fork_flags() != state.fork_flags() {
            info!(
                target: "chasers::organize",
                height = state.height(),
                from = format_args!("{:#x}", parent.fork_flags()),
                to = format_args!("{:#x}", state.fork_flags()),
                "fork flags changed"
            );
        }
        if parent.minimum_version() != state.minimum_version() {
            info!(
                target: "chasers::organize",
                height = state.height(),
                minimum = state.minimum_version(),
                "minimum block version changed"
            );
        }
    }
}
