//! Tracking of unassociated candidate heights and download-map handout.

use crate::events::EventBus;
use rbit_interfaces::{
    archive::{Archive, DownloadMap, Link},
    events::Chase,
};
use rbit_primitives::BlockNumber;
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, trace};

/// Maintains the set of candidate-chain heights whose blocks are not yet
/// downloaded, handing contiguous units out to channels and taking them back.
///
/// This is the backpressure point: no unit exceeds the configured inventory
/// limit, and a channel that stops releases its unit here. Units are FIFO.
#[derive(Debug)]
pub struct CheckChaser<A> {
    archive: Arc<A>,
    events: EventBus,
    maximum_inventory: usize,
    maps: VecDeque<DownloadMap>,
}

impl<A: Archive> CheckChaser<A> {
    /// Creates the chaser with the configured per-unit inventory limit.
    pub fn new(archive: Arc<A>, events: EventBus, maximum_inventory: usize) -> Self {
        Self { archive, events, maximum_inventory, maps: VecDeque::new() }
    }

    /// Seeds the queue with everything unassociated above the fork point.
    pub fn start(&mut self) {
        let fork_point = self.archive.get_fork();
        let added = self.pull_from(fork_point);
        debug!(
            target: "chasers::check",
            fork_point, unassociated = added, "seeded download queue"
        );
    }

    /// Reacts to bus events: extends on organization, purges on
    /// disorganization, re-solicits a malleated height.
    pub fn handle_event(&mut self, event: Chase) {
        match event {
            Chase::Header { branch_point } => self.add_headers(branch_point),
            Chase::Disorganized { top } => self.purge_headers(top),
            Chase::Malleated { link } => self.requeue_malleated(link),
            _ => {}
        }
    }

    /// Pops the front unit, transferring ownership to the caller. An empty
    /// map means no work; the caller waits for the next `download` event.
    pub fn get_hashes(&mut self) -> DownloadMap {
        let map = self.maps.pop_front().unwrap_or_default();
        trace!(
            target: "chasers::check",
            handed = map.len(), remaining = self.outstanding(), "hashes out"
        );
        map
    }

    /// Takes a unit back from a channel (stop, split, purge).
    pub fn put_hashes(&mut self, map: DownloadMap) {
        if map.is_empty() {
            return
        }
        let added = map.len();
        self.maps.push_back(map);
        trace!(
            target: "chasers::check",
            returned = added, remaining = self.outstanding(), "hashes back"
        );
        self.events.publish(Chase::Download { added });
    }

    /// Total outstanding (queued, not handed out) heights.
    pub fn outstanding(&self) -> usize {
        self.maps.iter().map(DownloadMap::len).sum()
    }

    fn add_headers(&mut self, branch_point: BlockNumber) {
        // Start above both the branch point and anything already associated
        // in the run above it.
        let start = self.archive.get_last_associated_from(branch_point);
        let start = self.maps.iter().filter_map(DownloadMap::top).max().unwrap_or(start).max(start);
        let added = self.pull_from(start);
        if added == 0 {
            return
        }
        self.events.publish(Chase::Download { added });
    }

    /// Queues a malleated height for a distinct re-download.
    ///
    /// The height reads as unassociated again, but it lies below anything
    /// already queued, so this pulls it directly rather than extending from
    /// the queue tops.
    fn requeue_malleated(&mut self, link: Link) {
        let Some(height) = self.archive.get_height(link) else { return };
        let map = self.archive.get_unassociated_above(height.saturating_sub(1), 1);
        // A superseding body may have landed since publication; queue only
        // the malleated height itself.
        if map.bottom() == Some(height) {
            self.put_hashes(map);
        }
    }

    fn purge_headers(&mut self, top: BlockNumber) {
        // The candidate chain was reset to the confirmed top: all outstanding
        // hashes are void. Channels observe the purge before any subsequent
        // download notification and return their maps.
        self.maps.clear();
        debug!(target: "chasers::check", top, "purged download queue");
        self.events.publish(Chase::Purge { top });
    }

    /// Repeatedly pulls units of up to the inventory limit until the archive
    /// reports nothing further unassociated.
    fn pull_from(&mut self, mut start: BlockNumber) -> usize {
        let mut added = 0;
        loop {
            let map = self.archive.get_unassociated_above(start, self.maximum_inventory);
            let Some(top) = map.top() else { break };
            added += map.len();
            self.maps.push_back(map);
            start = top;
        }
        metrics::gauge!("chasers.download_queue", self.outstanding() as f64);
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbit_interfaces::{
        archive::Archive,
        test_utils::{generators, MemoryArchive},
    };
    use rbit_primitives::{ChainParams, ChainState};
    use tokio::sync::broadcast::Receiver;

    fn archive_with_chain(len: usize) -> Arc<MemoryArchive> {
        let params = ChainParams::default();
        let genesis = generators::genesis();
        let state = ChainState::genesis(&genesis, &params);
        let archive =
            Arc::new(MemoryArchive::with_genesis(Arc::new(genesis.clone()), state.context()));
        let headers = generators::chain(&genesis, len);
        generators::seed_candidates(archive.as_ref(), &params, state, &headers);
        archive
    }

    fn drain(rx: &mut Receiver<Chase>) -> Vec<Chase> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn start_covers_all_unassociated_in_units() {
        let archive = archive_with_chain(25);
        let events = EventBus::new(16);
        let mut chaser = CheckChaser::new(archive, events, 10);
        chaser.start();

        // 25 unassociated heights above the fork in units of at most 10.
        assert_eq!(chaser.outstanding(), 25);
        let first = chaser.get_hashes();
        assert_eq!(first.len(), 10);
        assert_eq!((first.bottom(), first.top()), (Some(1), Some(10)));
        assert_eq!(chaser.get_hashes().len(), 10);
        assert_eq!(chaser.get_hashes().len(), 5);
        assert!(chaser.get_hashes().is_empty());
    }

    #[test]
    fn header_event_extends_from_branch_point() {
        let archive = archive_with_chain(5);
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut chaser = CheckChaser::new(archive.clone(), events, 100);
        chaser.start();
        assert_eq!(chaser.outstanding(), 5);

        // Three more candidates organized above height 5.
        let params = ChainParams::default();
        let top = archive.get_header(archive.to_candidate(5)).unwrap();
        let state = archive.get_candidate_chain_state(&params, 5).unwrap();
        let more = generators::chain(&top, 3);
        generators::seed_candidates(archive.as_ref(), &params, state, &more);

        chaser.handle_event(Chase::Header { branch_point: 5 });
        assert_eq!(chaser.outstanding(), 8);
        assert_eq!(drain(&mut rx), vec![Chase::Download { added: 3 }]);
    }

    #[test]
    fn malleated_height_is_requeued_below_queued_maps() {
        let archive = archive_with_chain(6);
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut chaser = CheckChaser::new(archive.clone(), events, 3);
        chaser.start();

        // A channel takes heights 1..=3; the unit covering 4..=6 stays
        // queued with a top above the height that will malleate.
        let taken = chaser.get_hashes();
        assert_eq!((taken.bottom(), taken.top()), (Some(1), Some(3)));
        assert_eq!(chaser.outstanding(), 3);

        // The block at height 2 associates, then is found malleated.
        let header = archive.get_header(archive.to_candidate(2)).unwrap();
        let link = archive.set_block_link(Arc::new(generators::block_for(&header)));
        assert!(!link.is_terminal());
        archive.set_malleable(link);

        chaser.handle_event(Chase::Malleated { link });

        // Height 2 is queued again despite the map topping out at 6.
        assert_eq!(chaser.outstanding(), 4);
        assert_eq!(drain(&mut rx), vec![Chase::Download { added: 1 }]);
        assert_eq!(chaser.get_hashes().bottom(), Some(4));
        let requeued = chaser.get_hashes();
        assert_eq!((requeued.bottom(), requeued.top()), (Some(2), Some(2)));
    }

    #[test]
    fn disorganized_purges_everything() {
        let archive = archive_with_chain(8);
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut chaser = CheckChaser::new(archive, events, 4);
        chaser.start();
        assert_eq!(chaser.outstanding(), 8);

        chaser.handle_event(Chase::Disorganized { top: 0 });
        assert_eq!(chaser.outstanding(), 0);
        assert!(chaser.get_hashes().is_empty());
        assert_eq!(drain(&mut rx), vec![Chase::Purge { top: 0 }]);
    }

    #[test]
    fn returned_maps_requeue_at_the_back() {
        let archive = archive_with_chain(6);
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut chaser = CheckChaser::new(archive, events, 3);
        chaser.start();

        let first = chaser.get_hashes();
        assert_eq!((first.bottom(), first.top()), (Some(1), Some(3)));

        chaser.put_hashes(first);
        assert_eq!(drain(&mut rx), vec![Chase::Download { added: 3 }]);

        // FIFO: the remaining unit comes first, the returned one after.
        assert_eq!(chaser.get_hashes().bottom(), Some(4));
        assert_eq!(chaser.get_hashes().bottom(), Some(1));
    }

    #[test]
    fn empty_returned_map_is_dropped() {
        let archive = archive_with_chain(2);
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut chaser = CheckChaser::new(archive, events, 10);
        chaser.start();

        chaser.put_hashes(DownloadMap::new());
        assert_eq!(chaser.outstanding(), 2);
        assert!(drain(&mut rx).is_empty());
    }
}
