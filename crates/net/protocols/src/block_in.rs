//! The headers-first inbound block protocol.

use rbit_chasers::{governor::Verdict, NodeHandle, PerformanceConfig};
use rbit_interfaces::{
    archive::{Archive, DownloadMap},
    consensus::Consensus,
    error::NodeError,
    events::Chase,
    p2p::{
        BlockMessage, Channel, GetData, InboundMessage, InvItem, InvType, Message, MessageKind,
    },
};
use rbit_primitives::BlockHash;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Obtains a hash-range map from the check chaser, requests the blocks,
/// validates each on receipt, and reports progress.
///
/// The map is the tracker: a block is accepted from the channel only if its
/// hash is outstanding in the map. On stop the remainder returns to the
/// chaser; on a split the tail half is donated back for an idle peer.
#[derive(Debug)]
pub struct BlockInProtocol<A, C, Ch> {
    archive: Arc<A>,
    consensus: Arc<C>,
    channel: Arc<Ch>,
    node: NodeHandle,
    performance: PerformanceConfig,
    block_type: InvType,
    map: DownloadMap,
    /// Hashes donated by a split: late arrivals cause no state change.
    donated: HashSet<BlockHash>,
    /// Bytes received in the current performance window.
    bytes: usize,
}

impl<A, C, Ch> BlockInProtocol<A, C, Ch>
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
        performance: PerformanceConfig,
    ) -> Self {
        let block_type = InvType::block_type(channel.is_witness());
        Self {
            archive,
            consensus,
            channel,
            node,
            performance,
            block_type,
            map: DownloadMap::new(),
            donated: HashSet::new(),
            bytes: 0,
        }
    }

    /// Runs the protocol until the channel stops.
    pub async fn run(mut self) {
        let mut subscription = self.channel.subscribe(&[MessageKind::Block]);
        let mut events = self.node.subscribe();

        if !self.refill().await {
            return self.stopping().await
        }

        let report = self.performance.enabled;
        let period = Duration::from_secs(self.performance.interval_seconds.max(1));
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Some(InboundMessage::Block(message)) => {
                        if !self.handle_block(&message).await {
                            break
                        }
                    }
                    Some(_) => {}
                    // Channel teardown drops the subscription.
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        if !self.handle_event(event).await {
                            break
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Missed notifications; resynchronize by refilling.
                        if self.map.is_empty() && !self.refill().await {
                            break
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = timer.tick(), if report => {
                    if !self.report_rate().await {
                        break
                    }
                }
            }
            if self.channel.is_stopped() {
                break
            }
        }
        self.stopping().await
    }

    /// Returns the outstanding map to the chaser on the way out.
    async fn stopping(mut self) {
        if !self.map.is_empty() {
            let map = std::mem::take(&mut self.map);
            let _ = self.node.put_hashes(self.channel.identifier(), map).await;
        }
        self.node.deregister(self.channel.identifier()).await;
        debug!(
            target: "protocols::block_in",
            authority = %self.channel.authority(), "block protocol done"
        );
    }

    /// Validates and stores one received block.
    ///
    /// Returns false when the channel should wind down.
    async fn handle_block(&mut self, message: &BlockMessage) -> bool {
        let block = &message.block;
        let hash = block.hash();

        let Some((height, entry)) = self.map.get(&hash).map(|(h, e)| (h, e.clone())) else {
            if self.donated.remove(&hash) {
                // Requested before the split, delivered after: the donee owns
                // it now, so no state change here.
                trace!(
                    target: "protocols::block_in",
                    %hash, authority = %self.channel.authority(), "donated block dropped"
                );
                return true
            }
            warn!(
                target: "protocols::block_in",
                %hash, authority = %self.channel.authority(), "unrequested block"
            );
            self.channel.stop(NodeError::Unknown);
            return false
        };

        if let Err(error) = self
            .consensus
            .check_block(block)
            .and_then(|()| self.consensus.check_block_context(block, &entry.context))
        {
            warn!(
                target: "protocols::block_in",
                %hash, height, %error,
                authority = %self.channel.authority(),
                "invalid block"
            );
            self.channel.stop(error.into());
            return false
        }

        if self.archive.set_block_link(block.clone()).is_terminal() {
            warn!(target: "protocols::block_in", %hash, "failure storing block");
            self.channel.stop(NodeError::StoreIntegrity);
            return false
        }

        // Block check accounted for.
        self.map.remove(&hash);
        self.bytes += message.cached_size();
        metrics::counter!("protocols.blocks_received", 1);
        self.node.publish(Chase::Checked { height });

        if self.map.is_empty() {
            trace!(
                target: "protocols::block_in",
                authority = %self.channel.authority(), "map exhausted"
            );
            return self.refill().await
        }
        true
    }

    /// Reacts to chase events relevant to this channel.
    async fn handle_event(&mut self, event: Chase) -> bool {
        match event {
            Chase::Download { .. } => {
                // New work while idle.
                if self.map.is_empty() {
                    return self.refill().await
                }
                true
            }
            Chase::Purge { .. } => {
                // All outstanding work is void; drop rather than return it.
                self.map = DownloadMap::new();
                self.donated.clear();
                self.refill().await
            }
            Chase::Split { channel } if channel == self.channel.identifier() => {
                self.split().await
            }
            Chase::Stop => false,
            _ => true,
        }
    }

    /// Donates the tail half of the outstanding map back to the chaser.
    async fn split(&mut self) -> bool {
        if self.map.len() < 2 {
            return true
        }
        let tail = self.map.split_tail();
        info!(
            target: "protocols::block_in",
            kept = self.map.len(),
            donated = tail.len(),
            authority = %self.channel.authority(),
            "splitting download work"
        );
        self.donated.extend(tail.hashes());
        self.node.put_hashes(self.channel.identifier(), tail).await.is_ok()
    }

    /// Fetches the next map and requests its blocks. An empty map leaves the
    /// channel idle until the next `download` event.
    async fn refill(&mut self) -> bool {
        match self.node.get_hashes(self.channel.identifier()).await {
            Ok(map) if map.is_empty() => {
                debug!(
                    target: "protocols::block_in",
                    authority = %self.channel.authority(), "exhausted block hashes"
                );
                true
            }
            Ok(map) => {
                trace!(
                    target: "protocols::block_in",
                    count = map.len(),
                    authority = %self.channel.authority(),
                    "requesting blocks"
                );
                let getter = GetData {
                    items: map
                        .hashes()
                        .map(|hash| InvItem { kind: self.block_type, hash })
                        .collect(),
                };
                self.map = map;
                self.channel.send(Message::GetData(getter)).is_ok()
            }
            Err(error) => {
                if !error.is_shutdown() {
                    self.channel.stop(error);
                }
                false
            }
        }
    }

    /// Computes the window's byte rate and reports it to the governor.
    async fn report_rate(&mut self) -> bool {
        let rate = self.bytes as u64 / self.performance.interval_seconds.max(1);
        trace!(
            target: "protocols::block_in",
            rate,
            bytes = self.bytes,
            authority = %self.channel.authority(),
            "rate report"
        );
        self.bytes = 0;

        match self
            .node
            .report_performance(self.channel.identifier(), rate, self.map.len())
            .await
        {
            Ok(Verdict::Normal) => true,
            Ok(Verdict::Slow) => {
                self.channel.stop(NodeError::SlowChannel);
                false
            }
            Ok(Verdict::Stalled) => {
                self.channel.stop(NodeError::StalledChannel);
                false
            }
            Err(_) => false,
        }
    }
}
