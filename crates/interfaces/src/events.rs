//! The chase event taxonomy.

use crate::archive::Link;
use crate::p2p::ChannelId;
use rbit_primitives::BlockNumber;

/// A chase notification published on the event bus.
///
/// Events carry a height, an archive link, or a channel identifier. Delivery
/// is in publication order per subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chase {
    /// The node started.
    Start,
    /// The node is closing; subscribers drop state.
    Stop,
    /// A strong branch was organized; candidate extends above the branch
    /// point.
    Header {
        /// Height at which the new branch attached.
        branch_point: BlockNumber,
    },
    /// A reorganization popped candidates above the branch point.
    Regressed {
        /// Height at which the new branch attached.
        branch_point: BlockNumber,
    },
    /// New unassociated heights are available for download.
    Download {
        /// Number of heights added.
        added: usize,
    },
    /// All outstanding download work is void; channels return their maps.
    Purge {
        /// Confirmed top after the reset.
        top: BlockNumber,
    },
    /// A block was checked and associated at a candidate height.
    Checked {
        /// The associated height.
        height: BlockNumber,
    },
    /// A checked block was found invalid.
    Unchecked {
        /// Link of the offending block.
        link: Link,
    },
    /// Accept+connect passed in candidate order.
    Preconfirmable {
        /// The validated height.
        height: BlockNumber,
    },
    /// Accept or connect failed on the candidate chain.
    Unpreconfirmable {
        /// Link of the offending block.
        link: Link,
    },
    /// The block was finalized into the confirmed chain.
    Confirmable {
        /// The confirmed height.
        height: BlockNumber,
    },
    /// Finalization failed on the candidate chain.
    Unconfirmable {
        /// Link of the offending block.
        link: Link,
    },
    /// The candidate chain was reset to the confirmed top.
    Disorganized {
        /// Confirmed top.
        top: BlockNumber,
    },
    /// A stored block at a candidate height was found malleated; a distinct
    /// re-download is awaited.
    Malleated {
        /// Link of the malleated block.
        link: Link,
    },
    /// A channel should donate half of its outstanding map.
    Split {
        /// The donor channel.
        channel: ChannelId,
    },
    /// A channel is idle with no download work available.
    Starved {
        /// The starved channel.
        channel: ChannelId,
    },
    /// Re-drive in-order validation.
    Bump,
}

impl Chase {
    /// The height carried by the event, if any.
    pub const fn height(&self) -> Option<BlockNumber> {
        match self {
            Self::Header { branch_point } | Self::Regressed { branch_point } => Some(*branch_point),
            Self::Purge { top } | Self::Disorganized { top } => Some(*top),
            Self::Checked { height } |
            Self::Preconfirmable { height } |
            Self::Confirmable { height } => Some(*height),
            _ => None,
        }
    }

    /// The archive link carried by the event, if any.
    pub const fn link(&self) -> Option<Link> {
        match self {
            Self::Unchecked { link } |
            Self::Unpreconfirmable { link } |
            Self::Unconfirmable { link } |
            Self::Malleated { link } => Some(*link),
            _ => None,
        }
    }
}
