//! A scripted [`Consensus`] implementation.

use crate::consensus::{Consensus, ValidateError};
use parking_lot::Mutex;
use rbit_primitives::{BlockHash, BlockNumber, ChainParams, Context, SealedBlock, SealedHeader};
use std::collections::HashSet;

/// A consensus that passes everything unless told otherwise, per stage and
/// per hash.
#[derive(Debug, Default)]
pub struct TestConsensus {
    fail_check_header: Mutex<HashSet<BlockHash>>,
    fail_accept_header: Mutex<HashSet<BlockHash>>,
    fail_check_block: Mutex<HashSet<BlockHash>>,
    fail_accept_block: Mutex<HashSet<BlockHash>>,
    fail_connect_block: Mutex<HashSet<BlockHash>>,
}

impl TestConsensus {
    /// Creates a consensus that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `check_header` fail for the hash.
    pub fn fail_check_header(&self, hash: BlockHash) {
        self.fail_check_header.lock().insert(hash);
    }

    /// Makes `accept_header` fail for the hash.
    pub fn fail_accept_header(&self, hash: BlockHash) {
        self.fail_accept_header.lock().insert(hash);
    }

    /// Makes `check_block` fail for the hash.
    pub fn fail_check_block(&self, hash: BlockHash) {
        self.fail_check_block.lock().insert(hash);
    }

    /// Makes `accept_block` fail for the hash.
    pub fn fail_accept_block(&self, hash: BlockHash) {
        self.fail_accept_block.lock().insert(hash);
    }

    /// Makes `connect_block` fail for the hash.
    pub fn fail_connect_block(&self, hash: BlockHash) {
        self.fail_connect_block.lock().insert(hash);
    }
}

impl Consensus for TestConsensus {
    fn check_header(
        &self,
        header: &SealedHeader,
        _params: &ChainParams,
    ) -> Result<(), ValidateError> {
        if self.fail_check_header.lock().contains(&header.hash()) {
            return Err(ValidateError::InsufficientWork { hash: header.hash() })
        }
        Ok(())
    }

    fn accept_header(&self, header: &SealedHeader, context: &Context) -> Result<(), ValidateError> {
        if self.fail_accept_header.lock().contains(&header.hash()) {
            return Err(ValidateError::OldVersion {
                version: header.version,
                minimum: context.minimum_version,
            })
        }
        Ok(())
    }

    fn check_block(&self, block: &SealedBlock) -> Result<(), ValidateError> {
        if self.fail_check_block.lock().contains(&block.hash()) {
            return Err(ValidateError::MerkleMismatch)
        }
        Ok(())
    }

    fn check_block_context(
        &self,
        block: &SealedBlock,
        _context: &Context,
    ) -> Result<(), ValidateError> {
        if self.fail_check_block.lock().contains(&block.hash()) {
            return Err(ValidateError::MerkleMismatch)
        }
        Ok(())
    }

    fn accept_block(
        &self,
        block: &SealedBlock,
        _context: &Context,
        _subsidy_interval: BlockNumber,
        _initial_subsidy: u64,
    ) -> Result<(), ValidateError> {
        if self.fail_accept_block.lock().contains(&block.hash()) {
            return Err(ValidateError::InvalidCoinbase)
        }
        Ok(())
    }

    fn connect_block(&self, block: &SealedBlock, _context: &Context) -> Result<(), ValidateError> {
        if self.fail_connect_block.lock().contains(&block.hash()) {
            return Err(ValidateError::InvalidScript { tx: block.hash() })
        }
        Ok(())
    }
}
