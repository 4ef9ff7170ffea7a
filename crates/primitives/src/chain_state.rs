use crate::{BlockHash, BlockNumber, ChainParams, SealedHeader, Work};
use serde::{Deserialize, Serialize};

/// Number of ancestor timestamps in the median-time-past window.
const MTP_WINDOW: usize = 11;

/// Validation context derived from a [`ChainState`], consumed by the
/// consensus predicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    /// Active fork flags.
    pub fork_flags: u32,
    /// Height of the subject header.
    pub height: BlockNumber,
    /// Median time past of the preceding window.
    pub median_time_past: u32,
    /// Timestamp of the subject header.
    pub timestamp: u32,
    /// Minimum acceptable block version.
    pub minimum_version: u32,
    /// Cumulative work including the subject header.
    pub work: Work,
}

/// Rolling consensus context at a chain height.
///
/// A state is an immutable snapshot: [`ChainState::roll`] produces a new
/// snapshot and never mutates its input. Snapshots are shared behind
/// [`std::sync::Arc`]: one per tree node, one for the candidate top, plus any
/// in-flight organize calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    /// Height of the header this state is rolled to.
    height: BlockNumber,
    /// Hash of the header this state is rolled to.
    hash: BlockHash,
    /// Cumulative branch work including this header.
    work: Work,
    /// Fork flags active at this height.
    fork_flags: u32,
    /// Minimum acceptable block version at this height.
    minimum_version: u32,
    /// Median time past of the window preceding this header.
    median_time_past: u32,
    /// Timestamp of this header.
    timestamp: u32,
    /// Timestamps of the trailing window ending at this header, oldest first.
    timestamps: Vec<u32>,
}

impl ChainState {
    /// Creates the state for a stored genesis header.
    pub fn genesis(header: &SealedHeader, params: &ChainParams) -> Self {
        Self {
            height: 0,
            hash: header.hash(),
            work: header.proof(),
            fork_flags: params.fork_flags(0),
            minimum_version: params.minimum_version(0),
            median_time_past: 0,
            timestamp: header.timestamp,
            timestamps: vec![header.timestamp],
        }
    }

    /// Reconstructs a state from stored chain data.
    ///
    /// `timestamps` is the trailing window ending at the subject header,
    /// oldest first; `work` is the cumulative work including the subject.
    pub fn from_parts(
        height: BlockNumber,
        hash: BlockHash,
        work: Work,
        timestamps: Vec<u32>,
        params: &ChainParams,
    ) -> Self {
        let timestamp = timestamps.last().copied().unwrap_or_default();
        let preceding = &timestamps[..timestamps.len().saturating_sub(1)];
        Self {
            height,
            hash,
            work,
            fork_flags: params.fork_flags(height),
            minimum_version: params.minimum_version(height),
            median_time_past: median(preceding),
            timestamp,
            timestamps,
        }
    }

    /// Rolls this state forward over `header`, producing the state at
    /// `height + 1`.
    pub fn roll(&self, header: &SealedHeader, params: &ChainParams) -> Self {
        let height = self.height + 1;
        let median_time_past = median(&self.timestamps);

        let mut timestamps = self.timestamps.clone();
        timestamps.push(header.timestamp);
        if timestamps.len() > MTP_WINDOW {
            timestamps.remove(0);
        }

        Self {
            height,
            hash: header.hash(),
            work: self.work + header.proof(),
            fork_flags: params.fork_flags(height),
            minimum_version: params.minimum_version(height),
            median_time_past,
            timestamp: header.timestamp,
            timestamps,
        }
    }

    /// Height of the header this state is rolled to.
    #[inline]
    pub const fn height(&self) -> BlockNumber {
        self.height
    }

    /// Hash of the header this state is rolled to.
    #[inline]
    pub const fn hash(&self) -> BlockHash {
        self.hash
    }

    /// Cumulative branch work including this header.
    #[inline]
    pub const fn cumulative_work(&self) -> Work {
        self.work
    }

    /// Active fork flags.
    #[inline]
    pub const fn fork_flags(&self) -> u32 {
        self.fork_flags
    }

    /// Minimum acceptable block version.
    #[inline]
    pub const fn minimum_version(&self) -> u32 {
        self.minimum_version
    }

    /// The validation context for the header this state is rolled to.
    pub fn context(&self) -> Context {
        Context {
            fork_flags: self.fork_flags,
            height: self.height,
            median_time_past: self.median_time_past,
            timestamp: self.timestamp,
            minimum_version: self.minimum_version,
            work: self.work,
        }
    }
}

/// Median of a timestamp window; zero for an empty window.
fn median(timestamps: &[u32]) -> u32 {
    if timestamps.is_empty() {
        return 0
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}
