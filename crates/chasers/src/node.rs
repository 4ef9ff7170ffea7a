//! The node task: the serial executor owning all chaser state.

use crate::{
    check::CheckChaser,
    config::NodeConfig,
    confirm::ConfirmChaser,
    events::EventBus,
    governor::{PerformanceGovernor, Verdict},
    organizer::HeaderOrganizer,
    preconfirm::PreconfirmChaser,
};
use rbit_interfaces::{
    archive::{Archive, DownloadMap},
    consensus::Consensus,
    error::NodeError,
    events::Chase,
    p2p::ChannelId,
};
use rbit_primitives::{BlockNumber, ChainParams, SealedHeader};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info};

/// A command posted to the node task from a channel task.
///
/// Every suspension point of the pipeline (`organize`, `get_hashes`,
/// `put_hashes`, performance reporting) is one of these; the reply arrives on
/// the carried oneshot.
#[derive(Debug)]
pub enum NodeCommand {
    /// Organize a header into the candidate chain or tree.
    Organize {
        /// The sealed header.
        header: Arc<SealedHeader>,
        /// Height on success.
        reply: oneshot::Sender<Result<BlockNumber, NodeError>>,
    },
    /// Take ownership of the next download map.
    GetHashes {
        /// The requesting channel.
        channel: ChannelId,
        /// The map; empty when no work is queued.
        reply: oneshot::Sender<Result<DownloadMap, NodeError>>,
    },
    /// Return ownership of an (unfinished) download map.
    PutHashes {
        /// The returning channel.
        channel: ChannelId,
        /// The outstanding remainder.
        map: DownloadMap,
        /// Completion.
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    /// Report a channel's byte rate for the elapsed window.
    ReportPerformance {
        /// The reporting channel.
        channel: ChannelId,
        /// Measured rate.
        bytes_per_second: u64,
        /// Outstanding map size on the channel.
        outstanding: usize,
        /// The governor's verdict.
        reply: oneshot::Sender<Result<Verdict, NodeError>>,
    },
    /// Drop a channel's performance state on disconnect.
    Deregister {
        /// The departing channel.
        channel: ChannelId,
    },
    /// Close the subsystem gracefully.
    Close,
}

/// A cloneable handle into the node task.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    events: EventBus,
}

impl NodeHandle {
    /// Organizes a header, returning its height.
    pub async fn organize(&self, header: Arc<SealedHeader>) -> Result<BlockNumber, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Organize { header, reply })
            .await
            .map_err(|_| NodeError::ServiceStopped)?;
        rx.await.map_err(|_| NodeError::ServiceStopped)?
    }

    /// Obtains the next download map; empty means wait for a `download`
    /// event.
    pub async fn get_hashes(&self, channel: ChannelId) -> Result<DownloadMap, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::GetHashes { channel, reply })
            .await
            .map_err(|_| NodeError::ServiceStopped)?;
        rx.await.map_err(|_| NodeError::ServiceStopped)?
    }

    /// Returns an outstanding download map.
    pub async fn put_hashes(
        &self,
        channel: ChannelId,
        map: DownloadMap,
    ) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::PutHashes { channel, map, reply })
            .await
            .map_err(|_| NodeError::ServiceStopped)?;
        rx.await.map_err(|_| NodeError::ServiceStopped)?
    }

    /// Reports a channel's measured byte rate.
    pub async fn report_performance(
        &self,
        channel: ChannelId,
        bytes_per_second: u64,
        outstanding: usize,
    ) -> Result<Verdict, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::ReportPerformance { channel, bytes_per_second, outstanding, reply })
            .await
            .map_err(|_| NodeError::ServiceStopped)?;
        rx.await.map_err(|_| NodeError::ServiceStopped)?
    }

    /// Drops a channel's performance state.
    pub async fn deregister(&self, channel: ChannelId) {
        let _ = self.commands.send(NodeCommand::Deregister { channel }).await;
    }

    /// Requests a graceful close.
    pub async fn close(&self) {
        let _ = self.commands.send(NodeCommand::Close).await;
    }

    /// Subscribes to chase events.
    pub fn subscribe(&self) -> broadcast::Receiver<Chase> {
        self.events.subscribe()
    }

    /// Publishes a chase event (used by protocols for `checked`).
    pub fn publish(&self, event: Chase) {
        self.events.publish(event);
    }
}

/// The node task: owns the chasers, drains the command queue, and dispatches
/// chase events in FIFO order.
///
/// No chaser state is ever touched from another task.
#[derive(Debug)]
pub struct Node<A, C> {
    organizer: HeaderOrganizer<A, C>,
    check: CheckChaser<A>,
    preconfirm: PreconfirmChaser<A, C>,
    confirm: ConfirmChaser<A>,
    governor: PerformanceGovernor,
    events: EventBus,
    commands: mpsc::Receiver<NodeCommand>,
    closed: Option<NodeError>,
}

impl<A: Archive, C: Consensus> Node<A, C> {
    /// Creates the node and a handle into it.
    pub fn new(
        archive: Arc<A>,
        consensus: Arc<C>,
        params: ChainParams,
        config: NodeConfig,
    ) -> (Self, NodeHandle) {
        let events = EventBus::new(config.event_capacity);
        let (tx, rx) = mpsc::channel(config.event_capacity);

        let node = Self {
            organizer: HeaderOrganizer::new(
                archive.clone(),
                consensus.clone(),
                params.clone(),
                events.clone(),
            ),
            check: CheckChaser::new(archive.clone(), events.clone(), config.maximum_inventory),
            preconfirm: PreconfirmChaser::new(
                archive.clone(),
                consensus,
                params.clone(),
                events.clone(),
            ),
            confirm: ConfirmChaser::new(archive, params, events.clone()),
            governor: PerformanceGovernor::new(config.performance, events.clone()),
            events: events.clone(),
            commands: rx,
            closed: None,
        };
        (node, NodeHandle { commands: tx, events })
    }

    /// Runs the node until closed or until every handle is dropped.
    ///
    /// Returns the fault if the subsystem closed on `store_integrity`.
    pub async fn run(mut self) -> Result<(), NodeError> {
        let mut events = self.events.subscribe();
        if let Err(fatal) = self.start() {
            error!(target: "chasers::node", %fatal, "node failed to start");
            return Err(fatal)
        }
        info!(target: "chasers::node", "node started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Close) => {
                        debug!(target: "chasers::node", "close requested");
                        self.close(None);
                        break
                    }
                    Some(command) => self.handle_command(command),
                    // Every handle dropped.
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.dispatch(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        error!(target: "chasers::node", missed, "node event queue lagged");
                        self.close(Some(NodeError::StoreIntegrity));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        match self.closed {
            Some(NodeError::ServiceStopped) | None => Ok(()),
            Some(fatal) => Err(fatal),
        }
    }

    fn start(&mut self) -> Result<(), NodeError> {
        self.organizer.start()?;
        self.check.start();
        self.preconfirm.start();
        self.confirm.start();
        self.events.publish(Chase::Start);
        Ok(())
    }

    /// Closes the subsystem: subsequent commands observe `service_stopped`
    /// and no further chase progress is published.
    fn close(&mut self, fault: Option<NodeError>) {
        if self.closed.is_some() {
            return
        }
        match &fault {
            Some(fatal) => error!(target: "chasers::node", %fatal, "node closing on fault"),
            None => info!(target: "chasers::node", "node closing"),
        }
        self.closed = Some(fault.unwrap_or(NodeError::ServiceStopped));
        self.events.publish(Chase::Stop);
        // The organizer drops its tree immediately rather than on dispatch;
        // dispatch is disabled once closed.
        let _ = self.organizer.handle_event(Chase::Stop);
    }

    fn handle_command(&mut self, command: NodeCommand) {
        if self.closed.is_some() {
            Self::reject(command);
            return
        }

        match command {
            NodeCommand::Organize { header, reply } => {
                let result = self.organizer.organize(header, now_seconds());
                if matches!(result, Err(NodeError::StoreIntegrity)) {
                    self.close(Some(NodeError::StoreIntegrity));
                }
                let _ = reply.send(result);
            }
            NodeCommand::GetHashes { channel, reply } => {
                let map = self.check.get_hashes();
                if map.is_empty() {
                    self.governor.starved(channel);
                } else {
                    self.governor.set_outstanding(channel, map.len());
                }
                let _ = reply.send(Ok(map));
            }
            NodeCommand::PutHashes { channel: _, map, reply } => {
                self.check.put_hashes(map);
                let _ = reply.send(Ok(()));
            }
            NodeCommand::ReportPerformance { channel, bytes_per_second, outstanding, reply } => {
                let verdict = self.governor.report(channel, bytes_per_second, outstanding);
                let _ = reply.send(Ok(verdict));
            }
            NodeCommand::Deregister { channel } => self.governor.deregister(channel),
            NodeCommand::Close => unreachable!("handled by the run loop"),
        }
    }

    /// Delivers one event to every chaser, in a fixed order, on this task.
    fn dispatch(&mut self, event: Chase) {
        if self.closed.is_some() {
            return
        }
        if let Err(fatal) = self.organizer.handle_event(event) {
            self.close(Some(fatal));
            return
        }
        self.check.handle_event(event);
        if let Err(fatal) = self.preconfirm.handle_event(event) {
            self.close(Some(fatal));
            return
        }
        if let Err(fatal) = self.confirm.handle_event(event) {
            self.close(Some(fatal));
        }
    }

    fn reject(command: NodeCommand) {
        match command {
            NodeCommand::Organize { reply, .. } => {
                let _ = reply.send(Err(NodeError::ServiceStopped));
            }
            NodeCommand::GetHashes { reply, .. } => {
                let _ = reply.send(Err(NodeError::ServiceStopped));
            }
            NodeCommand::PutHashes { reply, .. } => {
                let _ = reply.send(Err(NodeError::ServiceStopped));
            }
            NodeCommand::ReportPerformance { reply, .. } => {
                let _ = reply.send(Err(NodeError::ServiceStopped));
            }
            NodeCommand::Deregister { .. } | NodeCommand::Close => {}
        }
    }
}

fn now_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rbit_interfaces::test_utils::{generators, MemoryArchive, TestConsensus};
    use rbit_primitives::ChainState;

    fn spawn_node() -> (Arc<MemoryArchive>, NodeHandle, tokio::task::JoinHandle<Result<(), NodeError>>)
    {
        let params = ChainParams::default();
        let genesis = generators::genesis();
        let state = ChainState::genesis(&genesis, &params);
        let archive =
            Arc::new(MemoryArchive::with_genesis(Arc::new(genesis), state.context()));
        let (node, handle) = Node::new(
            archive.clone(),
            Arc::new(TestConsensus::new()),
            params,
            NodeConfig::default(),
        );
        let task = tokio::spawn(node.run());
        (archive, handle, task)
    }

    #[tokio::test]
    async fn organizes_headers_and_feeds_the_download_queue() {
        let (archive, handle, task) = spawn_node();
        let mut events = handle.subscribe();
        let genesis = generators::genesis();

        for header in generators::chain(&genesis, 3) {
            handle.organize(Arc::new(header)).await.unwrap();
        }
        assert_eq!(archive.get_top_candidate(), 3);

        // The check chaser queued the unassociated heights.
        let map = handle.get_hashes(1).await.unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!((map.bottom(), map.top()), (Some(1), Some(3)));

        // Header events reached subscribers in order.
        let mut branch_points = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Chase::Header { branch_point } = event {
                branch_points.push(branch_point);
            }
        }
        assert_eq!(branch_points, vec![0, 1, 2]);

        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn checked_blocks_preconfirm_and_confirm_in_order() {
        let (archive, handle, task) = spawn_node();
        let mut events = handle.subscribe();
        let genesis = generators::genesis();
        let headers = generators::chain(&genesis, 2);

        for header in &headers {
            handle.organize(Arc::new(header.clone())).await.unwrap();
        }
        let map = handle.get_hashes(1).await.unwrap();
        assert_eq!(map.len(), 2);

        // Simulate the block-in protocol: associate and publish checked.
        for (i, header) in headers.iter().enumerate() {
            let link = archive.set_block_link(Arc::new(generators::block_for(header)));
            assert!(!link.is_terminal());
            handle.publish(Chase::Checked { height: i as u64 + 1 });
        }

        // The cascade runs on the node task; wait for the confirm tail.
        let mut confirmed = Vec::new();
        while confirmed.len() < 2 {
            match events.recv().await.unwrap() {
                Chase::Confirmable { height } => confirmed.push(height),
                Chase::Stop => panic!("node stopped early"),
                _ => {}
            }
        }
        assert_eq!(confirmed, vec![1, 2]);
        assert_eq!(archive.get_top_confirmed(), 2);

        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn store_fault_closes_the_subsystem() {
        let (archive, handle, task) = spawn_node();
        let mut events = handle.subscribe();
        let genesis = generators::genesis();

        handle.organize(Arc::new(generators::child(&genesis))).await.unwrap();
        while events.try_recv().is_ok() {}

        // The next push fails mid-organize: fatal.
        archive.fail_push_candidate_after(0);
        let strong =
            generators::child_with(&genesis, generators::HARD_BITS, 1);
        assert_matches!(
            handle.organize(Arc::new(strong)).await,
            Err(NodeError::StoreIntegrity)
        );

        // In-flight and subsequent handlers observe service_stopped.
        assert_matches!(
            handle.organize(Arc::new(generators::genesis())).await,
            Err(NodeError::ServiceStopped)
        );
        assert_matches!(handle.get_hashes(1).await, Err(NodeError::ServiceStopped));

        // No further chase progress is published; the stream ends with stop.
        loop {
            match events.recv().await.unwrap() {
                Chase::Stop => break,
                Chase::Header { .. } |
                Chase::Checked { .. } |
                Chase::Preconfirmable { .. } |
                Chase::Confirmable { .. } => panic!("progress published after fault"),
                _ => {}
            }
        }
        assert_matches!(events.try_recv(), Err(_));

        drop(handle);
        assert_matches!(task.await.unwrap(), Err(NodeError::StoreIntegrity));
    }

    #[tokio::test]
    async fn empty_queue_starves_and_triggers_split() {
        let (_, handle, task) = spawn_node();
        let mut events = handle.subscribe();

        // Channel 1 reports holding plenty of work; channel 2 finds the
        // queue empty.
        handle.report_performance(1, 10_000, 1_000).await.unwrap();
        let map = handle.get_hashes(2).await.unwrap();
        assert!(map.is_empty());

        loop {
            match events.recv().await.unwrap() {
                Chase::Split { channel } => {
                    assert_eq!(channel, 1);
                    break
                }
                _ => {}
            }
        }

        handle.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_is_graceful() {
        let (_, handle, task) = spawn_node();
        handle.close().await;
        assert!(task.await.unwrap().is_ok());
        assert_matches!(
            handle.get_hashes(1).await,
            Err(NodeError::ServiceStopped)
        );
    }
}
