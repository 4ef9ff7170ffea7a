//! In-order finalization of preconfirmable blocks into the confirmed chain.

use crate::events::EventBus;
use rbit_interfaces::{
    archive::{Archive, BlockState},
    error::NodeError,
    events::Chase,
};
use rbit_primitives::{BlockNumber, ChainParams};
use std::sync::Arc;
use tracing::{info, trace};

/// Advances the in-order `confirmed` height by finalizing blocks already
/// marked preconfirmable, promoting the candidate chain to confirmed.
///
/// Invariant: `confirmed <= validated <= top_candidate`; the confirmed chain
/// is a prefix of the candidate chain.
#[derive(Debug)]
pub struct ConfirmChaser<A> {
    archive: Arc<A>,
    params: ChainParams,
    events: EventBus,
    /// Highest confirmed height.
    confirmed: BlockNumber,
}

impl<A: Archive> ConfirmChaser<A> {
    /// Creates the chaser.
    pub fn new(archive: Arc<A>, params: ChainParams, events: EventBus) -> Self {
        Self { archive, params, events, confirmed: 0 }
    }

    /// Initializes the watermark at the confirmed top.
    pub fn start(&mut self) {
        self.confirmed = self.archive.get_top_confirmed();
    }

    /// Highest confirmed height.
    pub fn confirmed(&self) -> BlockNumber {
        self.confirmed
    }

    /// Reacts to bus events.
    pub fn handle_event(&mut self, event: Chase) -> Result<(), NodeError> {
        match event {
            Chase::Start | Chase::Bump => self.bump(),
            Chase::Preconfirmable { height } => {
                if height == self.confirmed + 1 {
                    return self.bump()
                }
                Ok(())
            }
            Chase::Disorganized { top } => {
                // The candidate chain was reset to the confirmed top;
                // resynchronize the watermark to it.
                self.confirmed = top;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Finalizes candidate blocks in order from the watermark, stopping at
    /// the first height that is not yet preconfirmable.
    fn bump(&mut self) -> Result<(), NodeError> {
        loop {
            let height = self.confirmed + 1;
            let link = self.archive.to_candidate(height);
            if link.is_terminal() {
                return Ok(())
            }

            match self.archive.get_block_state(link) {
                BlockState::Preconfirmable | BlockState::Confirmable => {}
                BlockState::Unconfirmable => {
                    // Deferred finalization failure on the candidate chain.
                    info!(target: "chasers::confirm", height, "unconfirmable block");
                    self.events.publish(Chase::Unconfirmable { link });
                    return Ok(())
                }
                BlockState::Unknown => {
                    // The locked-in early chain confirms without validation
                    // marks; everything else waits for preconfirmation.
                    if !self.params.is_under_bypass(height) {
                        return Ok(())
                    }
                }
            }

            if !self.archive.set_block_confirmable(link) || !self.archive.push_confirmed(link) {
                return Err(NodeError::StoreIntegrity)
            }

            self.confirmed = height;
            self.events.publish(Chase::Confirmable { height });
            metrics::gauge!("chasers.confirmed_height", height as f64);
            if height % 1_000 == 0 {
                info!(target: "chasers::confirm", height, "confirmed chain");
            }
            trace!(target: "chasers::confirm", height, "block confirmed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbit_interfaces::{
        archive::Archive,
        test_utils::{generators, MemoryArchive},
    };
    use rbit_primitives::{ChainState, Checkpoint};
    use tokio::sync::broadcast::Receiver;

    fn harness(
        len: usize,
        params: ChainParams,
    ) -> (Arc<MemoryArchive>, ConfirmChaser<MemoryArchive>, Receiver<Chase>) {
        let genesis = generators::genesis();
        let state = ChainState::genesis(&genesis, &params);
        let archive =
            Arc::new(MemoryArchive::with_genesis(Arc::new(genesis.clone()), state.context()));
        let headers = generators::chain(&genesis, len);
        generators::seed_candidates(archive.as_ref(), &params, state, &headers);

        let events = EventBus::new(64);
        let rx = events.subscribe();
        let mut chaser = ConfirmChaser::new(archive.clone(), params, events);
        chaser.start();
        (archive, chaser, rx)
    }

    fn drain(rx: &mut Receiver<Chase>) -> Vec<Chase> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn confirms_preconfirmable_prefix_in_order() {
        let (archive, mut chaser, mut rx) = harness(4, ChainParams::default());
        for height in 1..=3u64 {
            assert!(archive.set_block_preconfirmable(archive.to_candidate(height)));
        }

        chaser.handle_event(Chase::Preconfirmable { height: 1 }).unwrap();

        assert_eq!(chaser.confirmed(), 3);
        assert_eq!(archive.get_top_confirmed(), 3);
        assert_eq!(
            drain(&mut rx),
            vec![
                Chase::Confirmable { height: 1 },
                Chase::Confirmable { height: 2 },
                Chase::Confirmable { height: 3 }
            ]
        );
        // Confirmed is a prefix of candidate.
        assert!(archive.get_top_confirmed() <= archive.get_top_candidate());
    }

    #[test]
    fn waits_for_the_preconfirmation_gap() {
        let (archive, mut chaser, mut rx) = harness(3, ChainParams::default());
        assert!(archive.set_block_preconfirmable(archive.to_candidate(2)));

        chaser.handle_event(Chase::Preconfirmable { height: 2 }).unwrap();
        assert_eq!(chaser.confirmed(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn unconfirmable_block_is_reported_not_promoted() {
        let (archive, mut chaser, mut rx) = harness(3, ChainParams::default());
        assert!(archive.set_block_preconfirmable(archive.to_candidate(1)));
        let bad = archive.to_candidate(2);
        assert!(archive.set_block_unconfirmable(bad));

        chaser.handle_event(Chase::Bump).unwrap();

        assert_eq!(chaser.confirmed(), 1);
        let events = drain(&mut rx);
        assert!(events.contains(&Chase::Confirmable { height: 1 }));
        assert!(events.contains(&Chase::Unconfirmable { link: bad }));
    }

    #[test]
    fn bypass_window_confirms_unmarked_blocks() {
        let genesis = generators::genesis();
        let headers = generators::chain(&genesis, 3);
        let params = ChainParams {
            milestone: Checkpoint::new(2, headers[1].hash()),
            ..Default::default()
        };
        let (archive, mut chaser, _) = harness(3, params);

        chaser.handle_event(Chase::Bump).unwrap();
        // Heights 1 and 2 confirm under the bypass; 3 waits for validation.
        assert_eq!(chaser.confirmed(), 2);
        assert_eq!(archive.get_top_confirmed(), 2);
    }

    #[test]
    fn disorganization_resynchronizes_the_watermark() {
        let (_, mut chaser, _) = harness(3, ChainParams::default());
        chaser.confirmed = 2;
        chaser.handle_event(Chase::Disorganized { top: 1 }).unwrap();
        assert_eq!(chaser.confirmed(), 1);
    }
}
