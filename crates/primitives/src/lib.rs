#![warn(missing_docs, unreachable_pub, unused_crate_dependencies)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Commonly used types for the rbit node core.
//!
//! This crate contains the Bitcoin chain value types consumed by the chasers
//! and the inbound protocols: headers, blocks, rolling chain state, and the
//! chain parameter set (checkpoints, milestone, fork schedule).

mod block;
mod chain_state;
mod checkpoints;
mod header;
mod params;

pub use block::{Block, OutPoint, SealedBlock, Transaction, TxInput, TxOutput};
pub use chain_state::{ChainState, Context};
pub use checkpoints::Checkpoint;
pub use header::{decode_compact, Header, SealedHeader};
pub use params::ChainParams;

/// A block or header hash (double SHA-256).
pub type BlockHash = primitive_types::H256;

/// A block height on the candidate or confirmed chain.
pub type BlockNumber = u64;

/// Cumulative or per-header proof-of-work.
pub type Work = primitive_types::U256;
