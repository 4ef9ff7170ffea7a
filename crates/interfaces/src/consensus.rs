//! Consensus predicates consumed as pure functions.

use rbit_primitives::{BlockHash, BlockNumber, ChainParams, Context, SealedBlock, SealedHeader};
use std::fmt::Debug;

/// The consensus rule set, consumed by the pipeline as pure predicates.
///
/// The pipeline decides *when* to run each stage (check on receipt, accept
/// and connect in candidate order) and what to do with the outcome; the rules
/// themselves live behind this trait.
#[auto_impl::auto_impl(&, Arc)]
pub trait Consensus: Debug + Send + Sync {
    /// Context-free header validity: proof of work against the target, target
    /// within the limit, timestamp within the future drift limit.
    fn check_header(&self, header: &SealedHeader, params: &ChainParams)
        -> Result<(), ValidateError>;

    /// Contextual header validity against the rolled state: version floor,
    /// median-time-past, expected work.
    fn accept_header(&self, header: &SealedHeader, context: &Context) -> Result<(), ValidateError>;

    /// Context-free block validity: merkle root, coinbase position, size
    /// bounds.
    fn check_block(&self, block: &SealedBlock) -> Result<(), ValidateError>;

    /// Contextual block checks that need only the stored context, run on the
    /// channel at receipt.
    fn check_block_context(
        &self,
        block: &SealedBlock,
        context: &Context,
    ) -> Result<(), ValidateError>;

    /// Contextual block acceptance in candidate order: subsidy schedule,
    /// maturity, fork-gated rules.
    fn accept_block(
        &self,
        block: &SealedBlock,
        context: &Context,
        subsidy_interval: BlockNumber,
        initial_subsidy: u64,
    ) -> Result<(), ValidateError>;

    /// Script and spend evaluation against resolved previous outputs.
    fn connect_block(&self, block: &SealedBlock, context: &Context) -> Result<(), ValidateError>;
}

/// A consensus rule violation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidateError {
    /// The header hash does not satisfy its target.
    #[error("header {hash} does not satisfy its proof-of-work target")]
    InsufficientWork {
        /// Offending header hash.
        hash: BlockHash,
    },

    /// The compact target exceeds the proof-of-work limit.
    #[error("target above proof-of-work limit (bits={bits:#010x})")]
    TargetAboveLimit {
        /// Offending compact target.
        bits: u32,
    },

    /// The timestamp exceeds the future drift limit.
    #[error("timestamp {timestamp} too far in the future")]
    FutureTimestamp {
        /// Offending timestamp.
        timestamp: u32,
    },

    /// The timestamp is not after median time past.
    #[error("timestamp {timestamp} not after median time past {median_time_past}")]
    Timestamp {
        /// Offending timestamp.
        timestamp: u32,
        /// The required floor.
        median_time_past: u32,
    },

    /// The block version is below the minimum for the height.
    #[error("version {version} below minimum {minimum}")]
    OldVersion {
        /// Offending version.
        version: u32,
        /// Required minimum.
        minimum: u32,
    },

    /// The merkle root does not commit to the transactions.
    #[error("merkle root mismatch")]
    MerkleMismatch,

    /// The block has no coinbase, or a non-first coinbase.
    #[error("invalid coinbase placement")]
    InvalidCoinbase,

    /// A previous output could not be resolved.
    #[error("missing previous output")]
    MissingPreviousOutput,

    /// The coinbase claims more than subsidy plus fees.
    #[error("coinbase overclaims ({claimed} > {allowed})")]
    CoinbaseValue {
        /// Claimed output value.
        claimed: u64,
        /// Allowed value.
        allowed: u64,
    },

    /// Script evaluation failed.
    #[error("script evaluation failed for transaction {tx}")]
    InvalidScript {
        /// Offending transaction hash.
        tx: BlockHash,
    },

    /// A double spend within or against the chain.
    #[error("double spend of {outpoint}")]
    DoubleSpend {
        /// Spent transaction hash.
        outpoint: BlockHash,
    },
}
