//! A scripted [`Channel`] implementation.

use crate::{
    error::NodeError,
    p2p::{Channel, ChannelId, InboundMessage, Message, MessageKind, Subscription},
};
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::mpsc;

/// A channel that records outbound messages and lets tests inject inbound
/// ones.
#[derive(Debug)]
pub struct TestChannel {
    id: ChannelId,
    witness: bool,
    stopped: Mutex<Option<NodeError>>,
    sent: Mutex<Vec<Message>>,
    subscribers: Mutex<Vec<(HashSet<MessageKind>, mpsc::UnboundedSender<InboundMessage>)>>,
}

impl TestChannel {
    /// Creates a channel with the given identifier.
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            witness: false,
            stopped: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Enables witness relay on the channel.
    pub fn with_witness(mut self) -> Self {
        self.witness = true;
        self
    }

    /// Delivers an inbound message to matching subscribers.
    pub fn inject(&self, message: InboundMessage) {
        let kind = message.kind();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(kinds, tx)| {
            if kinds.contains(&kind) {
                tx.send(message.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    /// All messages sent so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Drains and returns the messages sent so far.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// The stop reason, if the channel was stopped.
    pub fn stop_reason(&self) -> Option<NodeError> {
        self.stopped.lock().clone()
    }
}

impl Channel for TestChannel {
    fn identifier(&self) -> ChannelId {
        self.id
    }

    fn authority(&self) -> String {
        format!("test:{}", self.id)
    }

    fn is_witness(&self) -> bool {
        self.witness
    }

    fn send(&self, message: Message) -> Result<(), NodeError> {
        if self.is_stopped() {
            return Err(NodeError::OperationCanceled)
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn subscribe(&self, kinds: &[MessageKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((kinds.iter().copied().collect(), tx));
        rx
    }

    fn stop(&self, reason: NodeError) {
        let mut stopped = self.stopped.lock();
        if stopped.is_none() {
            *stopped = Some(reason);
        }
        // Wake subscribers so pending receives observe the stop.
        self.subscribers.lock().clear();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.lock().is_some()
    }
}
