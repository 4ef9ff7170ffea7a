//! The headers-first inbound header protocol.

use rbit_chasers::NodeHandle;
use rbit_interfaces::{
    archive::Archive,
    consensus::Consensus,
    error::NodeError,
    p2p::{
        locator_heights, Channel, GetHeaders, HeadersMessage, InboundMessage, Message, MessageKind,
        MAX_GET_HEADERS,
    },
};
use rbit_primitives::{ChainParams, ChainState, Checkpoint};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Solicits headers from one peer and feeds them to the organizer.
///
/// Header sync walks the candidate chain: the protocol keeps a rolling chain
/// state from the candidate top and requires each received header to connect
/// to it, so database reads are eliminated from the hot path.
#[derive(Debug)]
pub struct HeaderInProtocol<A, C, Ch> {
    archive: Arc<A>,
    consensus: Arc<C>,
    channel: Arc<Ch>,
    node: NodeHandle,
    params: ChainParams,
    /// Unconnecting announcements tolerated before disconnect.
    maximum_advertisement: usize,
    advertisements: usize,
}

impl<A, C, Ch> HeaderInProtocol<A, C, Ch>
where
    A: Archive,
    C: Consensus,
    Ch: Channel,
{
    /// Creates the protocol for one channel.
    pub fn new(
        archive: Arc<A>,
        consensus: Arc<C>,
        channel: Arc<Ch>,
        node: NodeHandle,
        params: ChainParams,
        maximum_advertisement: usize,
    ) -> Self {
        Self {
            archive,
            consensus,
            channel,
            node,
            params,
            maximum_advertisement,
            advertisements: 0,
        }
    }

    /// Runs the protocol until the channel stops.
    pub async fn run(mut self) {
        // Header sync is always from the archived (strong) candidate chain.
        let top = self.archive.get_top_candidate();
        let Some(state) = self.archive.get_candidate_chain_state(&self.params, top) else {
            self.channel.stop(NodeError::StoreIntegrity);
            return
        };
        let mut state = state;

        let mut subscription = self.channel.subscribe(&[MessageKind::Headers]);
        if self.send_get_headers().is_err() {
            return
        }

        while let Some(message) = subscription.recv().await {
            if self.channel.is_stopped() {
                break
            }
            let InboundMessage::Headers(message) = message else { continue };
            if !self.handle_headers(&message, &mut state).await {
                break
            }
        }
        debug!(
            target: "protocols::header_in",
            authority = %self.channel.authority(), "header protocol done"
        );
    }

    /// Processes one `headers` batch, organizing each header in order.
    ///
    /// Returns false when the channel should wind down.
    async fn handle_headers(
        &mut self,
        message: &HeadersMessage,
        state: &mut ChainState,
    ) -> bool {
        trace!(
            target: "protocols::header_in",
            count = message.headers.len(),
            authority = %self.channel.authority(),
            "headers batch"
        );

        for header in &message.headers {
            if self.channel.is_stopped() {
                return false
            }
            let hash = header.hash();

            if header.previous_hash != state.hash() {
                // Out of order: either an announcement of a tip we have not
                // solicited, or a misbehaving peer. Tolerated up to the
                // configured advertisement budget.
                self.advertisements += 1;
                if self.advertisements > self.maximum_advertisement {
                    warn!(
                        target: "protocols::header_in",
                        %hash,
                        authority = %self.channel.authority(),
                        "unconnecting headers beyond tolerance"
                    );
                    self.channel.stop(NodeError::ProtocolViolation);
                    return false
                }
                debug!(
                    target: "protocols::header_in",
                    %hash,
                    authority = %self.channel.authority(),
                    tolerated = self.advertisements,
                    "unconnecting header"
                );
                continue
            }

            if let Err(error) = self.consensus.check_header(header, &self.params) {
                warn!(
                    target: "protocols::header_in",
                    %hash, %error,
                    authority = %self.channel.authority(),
                    "invalid header (check)"
                );
                self.channel.stop(NodeError::ProtocolViolation);
                return false
            }

            // Checkpoints are chain validation, not header validation.
            if Checkpoint::is_conflict(&self.params.checkpoints, &hash, state.height() + 1) {
                warn!(
                    target: "protocols::header_in",
                    %hash,
                    authority = %self.channel.authority(),
                    "invalid header (checkpoint)"
                );
                self.channel.stop(NodeError::ProtocolViolation);
                return false
            }

            // Rolling forward eliminates the database cost.
            *state = state.roll(header, &self.params);

            if let Err(error) = self.consensus.accept_header(header, &state.context()) {
                warn!(
                    target: "protocols::header_in",
                    %hash, %error,
                    authority = %self.channel.authority(),
                    "invalid header (accept)"
                );
                self.channel.stop(NodeError::ProtocolViolation);
                return false
            }

            if state.height() % 1_000 == 0 {
                info!(
                    target: "protocols::header_in",
                    height = state.height(),
                    authority = %self.channel.authority(),
                    "header sync"
                );
            }
            metrics::counter!("protocols.headers_received", 1);

            match self.node.organize(header.clone()).await {
                Ok(_) => {}
                // Benign: another channel got there first.
                Err(NodeError::DuplicateHeader) => {}
                Err(error) if error.is_shutdown() => return false,
                Err(error) => {
                    self.channel.stop(error);
                    return false
                }
            }
        }

        // The protocol presumes a maximal batch unless complete.
        if message.headers.len() == MAX_GET_HEADERS {
            let tail = message.headers.last().expect("maximal batch is non-empty").hash();
            self.send_get_headers_after(vec![tail]).is_ok()
        } else {
            self.complete(state);
            true
        }
    }

    /// Signals peer completeness: the end of a catch-up sequence or a
    /// singleton announcement.
    fn complete(&self, state: &ChainState) {
        info!(
            target: "protocols::header_in",
            height = state.height(),
            authority = %self.channel.authority(),
            "headers complete"
        );
    }

    fn send_get_headers(&self) -> Result<(), NodeError> {
        let heights = locator_heights(self.archive.get_top_candidate());
        let locator = self.archive.get_candidate_hashes(&heights);
        self.send_get_headers_after(locator)
    }

    fn send_get_headers_after(&self, locator: Vec<rbit_primitives::BlockHash>) -> Result<(), NodeError> {
        if let Some(front) = locator.first() {
            trace!(
                target: "protocols::header_in",
                after = %front,
                authority = %self.channel.authority(),
                "requesting headers"
            );
        }
        self.channel.send(Message::GetHeaders(GetHeaders::new(locator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbit_chasers::{Node, NodeConfig};
    use rbit_interfaces::test_utils::{generators, MemoryArchive, TestChannel, TestConsensus};
    use rbit_primitives::{ChainState, SealedHeader};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        archive: Arc<MemoryArchive>,
        consensus: Arc<TestConsensus>,
        channel: Arc<TestChannel>,
        node_task: JoinHandle<Result<(), NodeError>>,
        protocol_task: JoinHandle<()>,
        handle: NodeHandle,
    }

    fn headers_message(headers: &[SealedHeader]) -> InboundMessage {
        InboundMessage::Headers(Arc::new(HeadersMessage {
            headers: headers.iter().cloned().map(Arc::new).collect(),
        }))
    }

    async fn harness(maximum_advertisement: usize) -> Harness {
        let params = ChainParams::default();
        let genesis = generators::genesis();
        let state = ChainState::genesis(&genesis, &params);
        let archive =
            Arc::new(MemoryArchive::with_genesis(Arc::new(genesis), state.context()));
        let consensus = Arc::new(TestConsensus::new());

        let (node, handle) = Node::new(
            archive.clone(),
            consensus.clone(),
            params.clone(),
            NodeConfig { event_capacity: 8192, ..Default::default() },
        );
        let node_task = tokio::spawn(node.run());

        let channel = Arc::new(TestChannel::new(1));
        let protocol = HeaderInProtocol::new(
            archive.clone(),
            consensus.clone(),
            channel.clone(),
            handle.clone(),
            params,
            maximum_advertisement,
        );
        let protocol_task = tokio::spawn(protocol.run());
        // Let the protocol subscribe and send its initial request.
        tokio::time::sleep(Duration::from_millis(20)).await;

        Harness { archive, consensus, channel, node_task, protocol_task, handle }
    }

    fn sent_get_headers(channel: &TestChannel) -> Vec<GetHeaders> {
        channel
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::GetHeaders(g) => Some(g),
                _ => None,
            })
            .collect()
    }

    async fn settle(h: &Harness) {
        // Drive until the protocol has drained its queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = h;
    }

    #[tokio::test]
    async fn linear_catch_up_continues_at_maximal_batches() {
        let h = harness(10).await;
        let genesis = generators::genesis();
        let headers = generators::chain(&genesis, MAX_GET_HEADERS + 500);

        let initial = sent_get_headers(&h.channel);
        assert_eq!(initial.len(), 1);
        assert!(initial[0].stop_hash.is_zero());

        // First, a maximal batch.
        h.channel.inject(headers_message(&headers[..MAX_GET_HEADERS]));
        let mut requests = sent_get_headers(&h.channel);
        for _ in 0..200 {
            if requests.len() >= 2 {
                break
            }
            settle(&h).await;
            requests = sent_get_headers(&h.channel);
        }

        // A continuation request from the batch tail.
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].locator,
            vec![headers[MAX_GET_HEADERS - 1].hash()]
        );
        assert!(requests[1].stop_hash.is_zero());

        // Then the remainder: a non-maximal batch completes the channel.
        h.channel.inject(headers_message(&headers[MAX_GET_HEADERS..]));
        for _ in 0..200 {
            if h.archive.get_top_candidate() == (MAX_GET_HEADERS + 500) as u64 {
                break
            }
            settle(&h).await;
        }

        assert_eq!(h.archive.get_top_candidate(), (MAX_GET_HEADERS + 500) as u64);
        assert_eq!(sent_get_headers(&h.channel).len(), 2);
        assert!(h.channel.stop_reason().is_none());

        h.handle.close().await;
        h.node_task.await.unwrap().unwrap();
        h.protocol_task.abort();
    }

    #[tokio::test]
    async fn sub_maximal_batch_does_not_continue() {
        let h = harness(10).await;
        let genesis = generators::genesis();
        let headers = generators::chain(&genesis, MAX_GET_HEADERS - 1);

        h.channel.inject(headers_message(&headers));
        for _ in 0..200 {
            if h.archive.get_top_candidate() == (MAX_GET_HEADERS - 1) as u64 {
                break
            }
            settle(&h).await;
        }

        assert_eq!(h.archive.get_top_candidate(), (MAX_GET_HEADERS - 1) as u64);
        // Only the initial request: one short of maximal means complete.
        assert_eq!(sent_get_headers(&h.channel).len(), 1);

        h.handle.close().await;
        h.node_task.await.unwrap().unwrap();
        h.protocol_task.abort();
    }

    #[tokio::test]
    async fn unconnecting_announcements_are_tolerated_to_a_point() {
        let h = harness(2).await;
        let genesis = generators::genesis();
        let stray =
            generators::chain(&generators::child_with(&genesis, generators::EASY_BITS, 9), 1);
        let connecting = generators::chain(&genesis, 2);

        // A tolerated announcement mixed into a batch does not cost the
        // connecting headers that follow it.
        let mut mixed = stray.clone();
        mixed.extend(connecting.iter().cloned());
        h.channel.inject(headers_message(&mixed));
        for _ in 0..200 {
            if h.archive.get_top_candidate() == 2 {
                break
            }
            settle(&h).await;
        }
        assert_eq!(h.archive.get_top_candidate(), 2);
        assert!(h.channel.stop_reason().is_none());

        // A second announcement stays within the budget.
        h.channel.inject(headers_message(&stray));
        settle(&h).await;
        assert!(h.channel.stop_reason().is_none());

        // The third crosses it.
        h.channel.inject(headers_message(&stray));
        for _ in 0..200 {
            if h.channel.stop_reason().is_some() {
                break
            }
            settle(&h).await;
        }
        assert_eq!(h.channel.stop_reason(), Some(NodeError::ProtocolViolation));

        h.handle.close().await;
        h.node_task.await.unwrap().unwrap();
        h.protocol_task.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_header_stops_the_channel_not_the_node() {
        let h = harness(10).await;
        let genesis = generators::genesis();
        let headers = generators::chain(&genesis, 2);
        h.consensus.fail_check_header(headers[1].hash());

        h.channel.inject(headers_message(&headers));
        for _ in 0..200 {
            if h.channel.stop_reason().is_some() {
                break
            }
            settle(&h).await;
        }

        assert_eq!(h.channel.stop_reason(), Some(NodeError::ProtocolViolation));
        // The first header landed; the node is alive.
        assert_eq!(h.archive.get_top_candidate(), 1);
        assert!(!h.node_task.is_finished());

        h.handle.close().await;
        h.node_task.await.unwrap().unwrap();
        h.protocol_task.await.unwrap();
    }
}
