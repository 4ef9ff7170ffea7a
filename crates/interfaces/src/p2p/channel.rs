//! The per-peer channel interface consumed by the inbound protocols.

use super::messages::{BlockMessage, HeadersMessage, Inventory, Message, NotFound};
use crate::error::NodeError;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies a peer channel for the lifetime of its connection.
pub type ChannelId = u64;

/// A message delivered by the channel to a subscriber.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// A `headers` batch.
    Headers(Arc<HeadersMessage>),
    /// An `inv` announcement.
    Inv(Arc<Inventory>),
    /// A `block`.
    Block(Arc<BlockMessage>),
    /// A `notfound` reply.
    NotFound(Arc<NotFound>),
}

impl InboundMessage {
    /// The kind tag of this message.
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Headers(_) => MessageKind::Headers,
            Self::Inv(_) => MessageKind::Inv,
            Self::Block(_) => MessageKind::Block,
            Self::NotFound(_) => MessageKind::NotFound,
        }
    }
}

/// Subscription filter tag for inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `headers` batches.
    Headers,
    /// `inv` announcements.
    Inv,
    /// `block` payloads.
    Block,
    /// `notfound` replies.
    NotFound,
}

/// An inbound message subscription.
///
/// Dropping the subscription unsubscribes; in-flight deliveries drain from
/// the queue without racing teardown.
pub type Subscription = mpsc::UnboundedReceiver<InboundMessage>;

/// A peer channel as seen by a protocol instance.
///
/// Each channel serializes its protocol handlers ("channel strand"); `send`
/// enqueues for transmission and never blocks. Stopping is idempotent: the
/// first reason wins and subsequent handler invocations observe
/// [`Channel::is_stopped`].
#[auto_impl::auto_impl(&, Arc)]
pub trait Channel: Send + Sync + 'static {
    /// The channel identifier.
    fn identifier(&self) -> ChannelId;

    /// Peer address for diagnostics.
    fn authority(&self) -> String;

    /// Returns true if witness relay is negotiated for this channel.
    fn is_witness(&self) -> bool;

    /// Enqueues a message for transmission.
    fn send(&self, message: Message) -> Result<(), NodeError>;

    /// Subscribes to inbound messages of the given kinds.
    fn subscribe(&self, kinds: &[MessageKind]) -> Subscription;

    /// Stops the channel with a reason; the disconnect is the recovery.
    fn stop(&self, reason: NodeError);

    /// Returns true once the channel is stopping or stopped.
    fn is_stopped(&self) -> bool;
}
