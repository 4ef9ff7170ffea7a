use crate::{BlockNumber, Checkpoint, Work};
use serde::{Deserialize, Serialize};

/// Fork activation flags carried by [`crate::ChainState`].
///
/// The flag values are opaque to the pipeline; the consensus predicates
/// interpret them.
pub mod forks {
    /// Coinbase height commitment (BIP34).
    pub const BIP34: u32 = 1 << 0;
    /// Strict DER signatures (BIP66).
    pub const BIP66: u32 = 1 << 1;
    /// `OP_CHECKLOCKTIMEVERIFY` (BIP65).
    pub const BIP65: u32 = 1 << 2;
    /// Relative lock-time (BIP68/112/113).
    pub const BIP68: u32 = 1 << 3;
    /// Segregated witness (BIP141).
    pub const SEGWIT: u32 = 1 << 4;
}

/// Consensus-relevant chain parameters.
///
/// These are configuration, not consensus rules: the pipeline reads heights,
/// windows and schedules from here and leaves rule evaluation to the
/// consensus predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    /// Hardcoded checkpoints the stored chain must match.
    pub checkpoints: Vec<Checkpoint>,
    /// Configured milestone under which validation cost may be bypassed.
    pub milestone: Checkpoint,
    /// Minimum branch cumulative work for a non-checkpointed header to be
    /// immediately storable.
    pub minimum_work: Work,
    /// Wall-clock window within which a header timestamp counts as current.
    /// Zero disables the currency test.
    pub currency_window_seconds: u64,
    /// Maximum tolerated future drift of a header timestamp.
    pub timestamp_limit_seconds: u32,
    /// Compact encoding of the largest valid proof-of-work target.
    pub proof_of_work_limit: u32,
    /// Height at which BIP34 activates.
    pub bip34_height: BlockNumber,
    /// Height at which BIP66 activates.
    pub bip66_height: BlockNumber,
    /// Height at which BIP65 activates.
    pub bip65_height: BlockNumber,
    /// Height at which BIP68/112/113 activate.
    pub bip68_height: BlockNumber,
    /// Height at which segregated witness activates.
    pub segwit_height: BlockNumber,
    /// Blocks between subsidy halvings.
    pub subsidy_interval: BlockNumber,
    /// Initial block subsidy in satoshis.
    pub initial_subsidy: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            checkpoints: Vec::new(),
            milestone: Checkpoint::default(),
            minimum_work: Work::zero(),
            currency_window_seconds: 0,
            timestamp_limit_seconds: 2 * 60 * 60,
            proof_of_work_limit: 0x1d00ffff,
            bip34_height: 227_931,
            bip66_height: 363_725,
            bip65_height: 388_381,
            bip68_height: 419_328,
            segwit_height: 481_824,
            subsidy_interval: 210_000,
            initial_subsidy: 50 * 100_000_000,
        }
    }
}

impl ChainParams {
    /// Fork flags active at the given height.
    pub fn fork_flags(&self, height: BlockNumber) -> u32 {
        let mut flags = 0;
        if height >= self.bip34_height {
            flags |= forks::BIP34;
        }
        if height >= self.bip66_height {
            flags |= forks::BIP66;
        }
        if height >= self.bip65_height {
            flags |= forks::BIP65;
        }
        if height >= self.bip68_height {
            flags |= forks::BIP68;
        }
        if height >= self.segwit_height {
            flags |= forks::SEGWIT;
        }
        flags
    }

    /// Minimum acceptable block version at the given height.
    pub fn minimum_version(&self, height: BlockNumber) -> u32 {
        if height >= self.bip65_height {
            4
        } else if height >= self.bip66_height {
            3
        } else if height >= self.bip34_height {
            2
        } else {
            1
        }
    }

    /// Returns true if the currency test is enabled.
    pub fn use_currency_window(&self) -> bool {
        self.currency_window_seconds != 0
    }

    /// Returns true if a header with `timestamp` is current relative to
    /// `now_seconds` (Unix wall clock).
    pub fn is_current(&self, timestamp: u32, now_seconds: u64) -> bool {
        if !self.use_currency_window() {
            return true
        }
        u64::from(timestamp) >= now_seconds.saturating_sub(self.currency_window_seconds)
    }

    /// Returns true if `height` is at or below the highest checkpoint.
    pub fn is_under_checkpoint(&self, height: BlockNumber) -> bool {
        Checkpoint::is_under(&self.checkpoints, height)
    }

    /// Returns true if block validation may be bypassed at `height`.
    ///
    /// The bypass window is the locked-in early chain: everything under the
    /// milestone or under a checkpoint.
    pub fn is_under_bypass(&self, height: BlockNumber) -> bool {
        (self.milestone.height != 0 && height <= self.milestone.height) ||
            self.is_under_checkpoint(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockHash;

    #[test]
    fn fork_flags_accumulate() {
        let params = ChainParams {
            bip34_height: 10,
            bip66_height: 20,
            bip65_height: 30,
            bip68_height: 40,
            segwit_height: 50,
            ..Default::default()
        };
        assert_eq!(params.fork_flags(9), 0);
        assert_eq!(params.fork_flags(10), forks::BIP34);
        assert_eq!(params.fork_flags(25), forks::BIP34 | forks::BIP66);
        assert_eq!(
            params.fork_flags(50),
            forks::BIP34 | forks::BIP66 | forks::BIP65 | forks::BIP68 | forks::SEGWIT
        );
    }

    #[test]
    fn minimum_version_steps() {
        let params = ChainParams {
            bip34_height: 10,
            bip66_height: 20,
            bip65_height: 30,
            ..Default::default()
        };
        assert_eq!(params.minimum_version(9), 1);
        assert_eq!(params.minimum_version(10), 2);
        assert_eq!(params.minimum_version(20), 3);
        assert_eq!(params.minimum_version(30), 4);
    }

    #[test]
    fn currency_window_disabled_is_always_current() {
        let params = ChainParams::default();
        assert!(params.is_current(0, u64::MAX));
    }

    #[test]
    fn currency_window_bounds() {
        let params = ChainParams { currency_window_seconds: 100, ..Default::default() };
        assert!(params.is_current(900, 1000));
        assert!(!params.is_current(899, 1000));
    }

    #[test]
    fn bypass_covers_milestone_and_checkpoints() {
        let params = ChainParams {
            checkpoints: vec![Checkpoint::new(5, BlockHash::repeat_byte(1))],
            milestone: Checkpoint::new(8, BlockHash::repeat_byte(2)),
            ..Default::default()
        };
        assert!(params.is_under_bypass(5));
        assert!(params.is_under_bypass(8));
        assert!(!params.is_under_bypass(9));
    }
}
