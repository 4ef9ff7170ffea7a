//! Error kinds surfaced by the acquisition pipeline.

use crate::consensus::ValidateError;
use rbit_primitives::BlockNumber;

/// The error kinds of the node core.
///
/// Propagation policy: protocol-layer kinds stop the channel, never the
/// subsystem; candidate-chain validation failures mark the archive entry and
/// trigger disorganization; [`NodeError::StoreIntegrity`] is fatal and closes
/// the subsystem; [`NodeError::ServiceStopped`] and
/// [`NodeError::OperationCanceled`] silently short-circuit handlers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The header is already present in the tree or archive. Benign.
    #[error("duplicate header")]
    DuplicateHeader,

    /// The header's parent is neither stored nor cached.
    #[error("orphan header")]
    OrphanHeader,

    /// The header conflicts with a hardcoded checkpoint.
    #[error("checkpoint conflict at height {height}")]
    CheckpointConflict {
        /// The conflicting height.
        height: BlockNumber,
    },

    /// The peer violated the protocol (out-of-order headers, oversized
    /// batch, announcements beyond tolerance).
    #[error("protocol violation")]
    ProtocolViolation,

    /// A storage write failed; the subsystem must close.
    #[error("store integrity violation")]
    StoreIntegrity,

    /// Validation skipped under the bypass window.
    #[error("validation bypassed")]
    ValidationBypass,

    /// The block is already marked confirmable.
    #[error("block confirmable")]
    BlockConfirmable,

    /// The block is already marked preconfirmable.
    #[error("block preconfirmable")]
    BlockPreconfirmable,

    /// The block is marked invalid for confirmation.
    #[error("block unconfirmable at height {height}")]
    BlockUnconfirmable {
        /// The stored height of the condemned block.
        height: BlockNumber,
    },

    /// The subsystem is closed; handlers short-circuit.
    #[error("service stopped")]
    ServiceStopped,

    /// An async operation was canceled by stop.
    #[error("operation canceled")]
    OperationCanceled,

    /// The channel timed out.
    #[error("channel timeout")]
    ChannelTimeout,

    /// The channel's byte rate stayed below the floor.
    #[error("slow channel")]
    SlowChannel,

    /// The channel made no progress with outstanding work.
    #[error("stalled channel")]
    StalledChannel,

    /// Unrequested or otherwise unidentifiable data from the peer.
    #[error("unknown message")]
    Unknown,

    /// A consensus rule violation.
    #[error(transparent)]
    Validation(#[from] ValidateError),
}

impl NodeError {
    /// Returns true for kinds that silently short-circuit handlers.
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::ServiceStopped | Self::OperationCanceled)
    }

    /// Returns true for the benign duplicate outcome.
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateHeader)
    }
}
