//! In-order accept+connect validation of associated candidate blocks.

use crate::events::EventBus;
use rbit_interfaces::{
    archive::{Archive, BlockState, Link},
    consensus::{Consensus, ValidateError},
    error::NodeError,
    events::Chase,
};
use rbit_primitives::{BlockNumber, ChainParams};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Advances the in-order `validated` height by running accept+connect on
/// each newly-associated candidate block above it.
///
/// Checked notifications arrive out of order; advancement is strictly
/// in-order from the watermark.
#[derive(Debug)]
pub struct PreconfirmChaser<A, C> {
    archive: Arc<A>,
    consensus: Arc<C>,
    params: ChainParams,
    events: EventBus,
    /// Highest candidate height whose block passed accept+connect.
    validated: BlockNumber,
}

impl<A: Archive, C: Consensus> PreconfirmChaser<A, C> {
    /// Creates the chaser.
    pub fn new(archive: Arc<A>, consensus: Arc<C>, params: ChainParams, events: EventBus) -> Self {
        Self { archive, consensus, params, events, validated: 0 }
    }

    /// Initializes the watermark at the fork point.
    pub fn start(&mut self) {
        self.validated = self.archive.get_fork();
    }

    /// Highest validated candidate height.
    pub fn validated(&self) -> BlockNumber {
        self.validated
    }

    /// Reacts to bus events; these come out of order, the bump advances in
    /// order.
    pub fn handle_event(&mut self, event: Chase) -> Result<(), NodeError> {
        match event {
            Chase::Start | Chase::Bump => self.bump(),
            Chase::Checked { height } => {
                if height == self.validated + 1 {
                    return self.bump()
                }
                Ok(())
            }
            Chase::Regressed { branch_point } => {
                if branch_point < self.validated {
                    self.validated = branch_point;
                }
                self.bump()
            }
            Chase::Disorganized { top } => {
                // The candidate chain was fully reverted to the confirmed
                // top.
                self.validated = top;
                self.bump()
            }
            _ => Ok(()),
        }
    }

    /// Validates checked blocks starting immediately after the watermark,
    /// stopping at the first unassociated height or validation failure.
    fn bump(&mut self) -> Result<(), NodeError> {
        loop {
            let height = self.validated + 1;
            let link = self.archive.to_candidate(height);
            if link.is_terminal() || !self.archive.is_associated(link) {
                return Ok(())
            }

            match self.validate(link, height) {
                Ok(()) => {
                    // Tx states are committed first; they are independent of
                    // block validation.
                    if !self.archive.set_txs_connected(link) ||
                        !self.archive.set_block_preconfirmable(link)
                    {
                        return Err(NodeError::StoreIntegrity)
                    }
                    self.advance(height);
                }
                Err(
                    NodeError::ValidationBypass |
                    NodeError::BlockConfirmable |
                    NodeError::BlockPreconfirmable,
                ) => {
                    metrics::counter!("chasers.validation_bypassed", 1);
                    self.advance(height);
                }
                Err(NodeError::StoreIntegrity) => return Err(NodeError::StoreIntegrity),
                Err(error) => {
                    if self.archive.is_malleable(link) {
                        // A distinct block of the same identity may replace
                        // it; await the re-download rather than condemn the
                        // header.
                        info!(
                            target: "chasers::preconfirm",
                            height, %error, "malleated block"
                        );
                        self.events.publish(Chase::Malleated { link });
                    } else {
                        if !matches!(error, NodeError::BlockUnconfirmable { .. }) &&
                            !self.archive.set_block_unconfirmable(link)
                        {
                            return Err(NodeError::StoreIntegrity)
                        }
                        info!(
                            target: "chasers::preconfirm",
                            height, %error, "unpreconfirmable block"
                        );
                        self.events.publish(Chase::Unpreconfirmable { link });
                    }
                    return Ok(())
                }
            }
        }
    }

    fn advance(&mut self, height: BlockNumber) {
        self.validated = height;
        self.events.publish(Chase::Preconfirmable { height });
        metrics::gauge!("chasers.validated_height", height as f64);
        if height % 1_000 == 0 {
            info!(target: "chasers::preconfirm", height, "validated chain");
        }
        trace!(target: "chasers::preconfirm", height, "block validated");
    }

    /// Validates one associated candidate block.
    fn validate(&self, link: Link, height: BlockNumber) -> Result<(), NodeError> {
        // The locked-in early chain is bypassed unless the stored block is
        // suspect.
        if self.params.is_under_bypass(height) && !self.archive.is_malleable(link) {
            return Err(NodeError::ValidationBypass)
        }

        match self.archive.get_block_state(link) {
            BlockState::Confirmable => return Err(NodeError::BlockConfirmable),
            BlockState::Preconfirmable => return Err(NodeError::BlockPreconfirmable),
            BlockState::Unconfirmable => return Err(NodeError::BlockUnconfirmable { height }),
            BlockState::Unknown => {}
        }

        let block = self.archive.get_block(link).ok_or(NodeError::StoreIntegrity)?;
        let context = self.archive.get_context(link).ok_or(NodeError::StoreIntegrity)?;

        if !self.archive.populate(&block) {
            return Err(ValidateError::MissingPreviousOutput.into())
        }

        self.consensus.accept_block(
            &block,
            &context,
            self.params.subsidy_interval,
            self.params.initial_subsidy,
        )?;
        self.consensus.connect_block(&block, &context)?;
        debug!(target: "chasers::preconfirm", height, "accept+connect passed");
        Ok(())
    }
}
