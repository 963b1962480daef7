//! Change coordinator.
//!
//! Every management node runs one coordinator actor which owns the node's relationship to
//! the cluster configuration: it drives the prepare/commit/abort handshake for at most one
//! in-flight change cluster wide, participates in changes driven by peers, runs the pairwise
//! consistency checking gossip, and owns the active configuration document. All waiting is
//! modeled as pending-reply sets inside the state machine rather than blocked calls, so a
//! node failure notification can always unwind an in-flight protocol step.
//!
//! ## Known limitation
//! If the node coordinating a change fails mid-protocol, participants which have already
//! staged the candidate keep it staged and block further changes until an operator resolves
//! the staged file on disk. No takeover of the coordinating role is attempted.

mod change;
mod check;
mod protocol;
#[cfg(test)]
mod protocol_test;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ConfigError, ShutdownError};
use crate::model::{ConfigDocument, ProtocolState};
use crate::network::{PeerMessage, PeerNetwork};
use crate::ports::DynamicPortRegistry;
use crate::storage::StagingStore;
use crate::NodeId;

const METRIC_CHANGES_COMMITTED: &str = "mgmtd_config_changes_committed";
const METRIC_CHANGES_ABORTED: &str = "mgmtd_config_changes_aborted";
const METRIC_CHECK_FAILURES: &str = "mgmtd_config_check_failures";

/// The change coordinator actor of the local management node.
pub struct CoordinatorCtl {
    /// The ID of this node in the cluster.
    id: NodeId,
    /// The application's runtime config.
    config: Arc<Config>,
    /// The durable staging store for the local node's configuration files.
    store: StagingStore,
    /// The transport carrying protocol messages between management nodes.
    network: Arc<dyn PeerNetwork>,

    /// A channel of inbound requests, cloned for loopback sends to self.
    requests_tx: mpsc::Sender<CoordinatorCtlMsg>,
    /// A channel of inbound requests.
    requests_rx: ReceiverStream<CoordinatorCtlMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The local node's lifecycle relative to a confirmed configuration.
    state: ProtocolState,
    /// The active configuration document, if any. Immutable, only ever swapped wholesale.
    current: Option<Arc<ConfigDocument>>,
    /// The snapshot of the active document served to concurrent readers.
    published: Arc<ArcSwapOption<ConfigDocument>>,
    /// A channel publishing management peer addresses to the transport.
    peer_addrs_tx: watch::Sender<Arc<HashMap<NodeId, String>>>,

    /// The management node set of the active document, excluding no-wait nodes.
    mgmt_nodes: BTreeSet<NodeId>,
    /// Management peers currently connected.
    connected: BTreeSet<NodeId>,
    /// Management peers which have passed a consistency check since the last document change.
    checked: BTreeSet<NodeId>,

    /// The driving state of the change this node is coordinating, if any.
    change: ChangeState,
    /// The staged change this node is participating in, if any.
    ///
    /// Held separately from the driving state so the coordinating node can accept its own
    /// loopback Prepare while driving.
    staged: Option<StagedChange>,
    /// The first fatal error hit by this node. Set only once; terminates the process.
    fatal_err: Option<ShutdownError>,
}

impl CoordinatorCtl {
    /// Create a new instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>, store: StagingStore, recovered: Option<ConfigDocument>, initial: Option<ConfigDocument>, network: Arc<dyn PeerNetwork>,
        ports: DynamicPortRegistry, peer_addrs_tx: watch::Sender<Arc<HashMap<NodeId, String>>>, shutdown_tx: broadcast::Sender<()>,
        requests_tx: mpsc::Sender<CoordinatorCtlMsg>, requests_rx: mpsc::Receiver<CoordinatorCtlMsg>,
    ) -> (Self, CoordinatorHandle) {
        metrics::register_counter!(METRIC_CHANGES_COMMITTED, metrics::Unit::Count, "the number of configuration changes committed by this node");
        metrics::register_counter!(METRIC_CHANGES_ABORTED, metrics::Unit::Count, "the number of configuration changes aborted by this node");
        metrics::register_counter!(METRIC_CHECK_FAILURES, metrics::Unit::Count, "the number of failed peer consistency checks");

        let (state, current) = match (recovered, initial) {
            (Some(doc), _) => (ProtocolState::Confirmed, Some(Arc::new(doc))),
            (None, Some(doc)) => (ProtocolState::Initial, Some(Arc::new(doc))),
            (None, None) => (ProtocolState::Uninitialized, None),
        };
        let published = Arc::new(ArcSwapOption::from(current.clone()));
        let handle = CoordinatorHandle {
            tx: requests_tx.clone(),
            published: published.clone(),
            ports,
        };
        let mut this = Self {
            id: config.node_id,
            config,
            store,
            network,
            requests_tx,
            requests_rx: ReceiverStream::new(requests_rx),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            state,
            current,
            published,
            peer_addrs_tx,
            mgmt_nodes: Default::default(),
            connected: Default::default(),
            checked: Default::default(),
            change: ChangeState::Idle,
            staged: None,
            fatal_err: None,
        };
        this.refresh_membership();
        (this, handle)
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(node = self.id, state = ?self.state, "change coordinator has started");

        let check_interval = Duration::from_secs(self.config.check_interval_seconds.max(1));
        let check_timer = tokio::time::sleep(check_interval);
        tokio::pin!(check_timer);

        loop {
            tokio::select! {
                msg_opt = self.requests_rx.next() => match msg_opt {
                    Some(msg) => self.handle_msg(msg).await,
                    None => {
                        let _ = self.shutdown_tx.send(());
                    }
                },
                _ = &mut check_timer => {
                    check_timer.set(tokio::time::sleep(check_interval));
                    self.run_consistency_checks();
                    self.maybe_start_initial_change().await;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!(node = self.id, "change coordinator has shutdown");
        match self.fatal_err.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Handle a coordinator message.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_msg(&mut self, msg: CoordinatorCtlMsg) {
        match msg {
            CoordinatorCtlMsg::Peer { from, msg } => self.handle_peer_msg(from, msg).await,
            CoordinatorCtlMsg::RequestChange { document, tx } => self.handle_change_request(document, Requester::Local(tx)).await,
            CoordinatorCtlMsg::Status { tx } => self.handle_status(tx),
            CoordinatorCtlMsg::PeerConnected { node } => self.handle_peer_connected(node),
            CoordinatorCtlMsg::PeerDisconnected { node } => self.handle_peer_disconnected(node).await,
        }
    }

    /// Handle a protocol message from a peer node, or from the local loopback.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_peer_msg(&mut self, from: NodeId, msg: PeerMessage) {
        match msg {
            PeerMessage::Handshake { .. } => tracing::warn!(from, "unexpected handshake message reached the coordinator"),
            PeerMessage::CheckRequest { state, generation, checksum } => self.handle_check_request(from, state, generation, checksum),
            PeerMessage::CheckConf { state: _, generation: _ } => self.handle_check_conf(from).await,
            PeerMessage::CheckRef {
                error,
                generation: _,
                expected_generation,
                state: _,
                expected_state,
                document,
            } => self.handle_check_ref(from, error, expected_generation, expected_state, document).await,
            PeerMessage::ChangeRequest { document } => self.handle_change_request(document, Requester::Peer(from)).await,
            PeerMessage::ChangeConf => tracing::debug!(from, "configuration change confirmed by remote coordinator"),
            PeerMessage::ChangeRef { error } => tracing::debug!(from, error = %error, "configuration change refused by remote coordinator"),
            PeerMessage::PrepareRequest { document, initial } => self.handle_prepare(from, document, initial).await,
            PeerMessage::PrepareConf => self.handle_prepare_conf(from).await,
            PeerMessage::PrepareRef { error } => self.handle_prepare_ref(from, error).await,
            PeerMessage::CommitRequest => self.handle_commit(from).await,
            PeerMessage::CommitConf => self.handle_commit_conf(from).await,
            PeerMessage::AbortRequest => self.handle_abort(from).await,
            PeerMessage::AbortConf => self.handle_abort_conf(from).await,
        }
    }

    /// Handle a request for the coordinator's current status.
    fn handle_status(&self, tx: oneshot::Sender<CoordinatorStatus>) {
        let status = CoordinatorStatus {
            state: self.state,
            generation: self.current.as_ref().map(|doc| doc.generation).unwrap_or(0),
            checksum: self.current.as_ref().map(|doc| doc.checksum()),
            change_in_progress: !matches!(self.change, ChangeState::Idle) || self.staged.is_some(),
        };
        let _ = tx.send(status);
    }

    /// Handle a new connection to a management peer.
    fn handle_peer_connected(&mut self, node: NodeId) {
        tracing::debug!(node, "management peer connected");
        self.connected.insert(node);
        self.send_check_to(node);
    }

    /// Send a message to the target management node, looping back through the local queue
    /// when the target is this node itself.
    fn send_peer(&self, target: NodeId, msg: PeerMessage) -> Result<()> {
        if target == self.id {
            return self
                .requests_tx
                .try_send(CoordinatorCtlMsg::Peer { from: self.id, msg })
                .map_err(|err| anyhow::anyhow!("error looping message back to self: {}", err));
        }
        self.network.send(target, msg)
    }

    /// Record a fatal error and trigger process shutdown.
    ///
    /// Used for conditions where continuing would let this node's view of the configuration
    /// silently diverge from the cluster's or from its own disk.
    fn fatal(&mut self, err: anyhow::Error) {
        tracing::error!(error = ?err, "fatal configuration protocol condition, shutting down");
        if self.fatal_err.is_none() {
            self.fatal_err = Some(ShutdownError(err));
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Install the given document as the active confirmed configuration.
    fn apply_document(&mut self, doc: Arc<ConfigDocument>) {
        tracing::info!(generation = doc.generation, checksum = doc.checksum(), "configuration applied");
        self.state = ProtocolState::Confirmed;
        self.published.store(Some(doc.clone()));
        self.current = Some(doc);
        self.refresh_membership();
        // Consistency must be re-established against the new document.
        self.checked.clear();
    }

    /// Recompute the management node set and peer addresses from the active document.
    fn refresh_membership(&mut self) {
        let (mgmt, addrs) = match &self.current {
            Some(doc) => {
                let mut mgmt = doc.management_node_ids();
                mgmt.retain(|id| !self.config.no_wait_nodes.contains(id));
                let mut addrs = doc.management_node_addrs();
                let id = self.id;
                addrs.retain(|node, _| *node != id && mgmt.contains(node));
                (mgmt, addrs)
            }
            None => Default::default(),
        };
        self.mgmt_nodes = mgmt;
        let _ = self.peer_addrs_tx.send(Arc::new(addrs));
    }

    /// The management node designated to initiate changes: the lowest live node ID.
    fn initiator_id(&self) -> NodeId {
        self.mgmt_nodes
            .iter()
            .copied()
            .find(|id| *id == self.id || self.connected.contains(id))
            .unwrap_or(self.id)
    }

    /// A bool indicating if every management peer is connected and consistency checked.
    fn all_peers_ready(&self) -> bool {
        self.mgmt_nodes
            .iter()
            .all(|id| *id == self.id || (self.connected.contains(id) && self.checked.contains(id)))
    }

    /// Deliver the outcome of a change to whoever requested it.
    fn respond_requester(&self, requester: Requester, result: ::std::result::Result<(), ConfigError>) {
        match requester {
            Requester::None => (),
            Requester::Local(tx) => {
                let _ = tx.send(result);
            }
            Requester::Peer(node) => {
                let msg = match result {
                    Ok(()) => PeerMessage::ChangeConf,
                    Err(error) => PeerMessage::ChangeRef { error },
                };
                if let Err(err) = self.send_peer(node, msg) {
                    tracing::warn!(error = ?err, node, "error replying to change requester");
                }
            }
        }
    }
}

/// A message bound for the change coordinator.
pub enum CoordinatorCtlMsg {
    /// A protocol message from a peer node, or from the local loopback.
    Peer {
        /// The node the message originated from.
        from: NodeId,
        /// The protocol message.
        msg: PeerMessage,
    },
    /// A locally submitted configuration change request.
    RequestChange {
        /// The candidate document; its generation is assigned by the coordinator.
        document: ConfigDocument,
        /// The response channel.
        tx: oneshot::Sender<::std::result::Result<(), ConfigError>>,
    },
    /// A request for the coordinator's current status.
    Status {
        /// The response channel.
        tx: oneshot::Sender<CoordinatorStatus>,
    },
    /// The transport established a connection to the given management peer.
    PeerConnected {
        /// The connected peer.
        node: NodeId,
    },
    /// The transport lost the connection to the given management peer.
    PeerDisconnected {
        /// The disconnected peer.
        node: NodeId,
    },
}

/// A snapshot of the coordinator's state for status reporting.
#[derive(Clone, Debug)]
pub struct CoordinatorStatus {
    /// The node's lifecycle relative to a confirmed configuration.
    pub state: ProtocolState,
    /// The generation of the active document, `0` when none is held.
    pub generation: u64,
    /// The checksum of the active document, if any is held.
    pub checksum: Option<u64>,
    /// A bool indicating if a change is being driven or staged on this node.
    pub change_in_progress: bool,
}

/// A handle used for local administrative access to the change coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    /// The channel into the coordinator.
    tx: mpsc::Sender<CoordinatorCtlMsg>,
    /// The snapshot of the active document served to concurrent readers.
    published: Arc<ArcSwapOption<ConfigDocument>>,
    /// The registry of runtime negotiated dynamic ports.
    ports: DynamicPortRegistry,
}

impl CoordinatorHandle {
    /// The currently served configuration document, with dynamic ports overlaid.
    ///
    /// The stored generation versioned document is never mutated by the overlay.
    pub fn current_config(&self) -> Option<ConfigDocument> {
        self.published.load_full().map(|doc| self.ports.overlay(&doc))
    }

    /// Record a runtime negotiated dynamic port for the given node pair.
    pub fn register_dynamic_port(&self, node_a: NodeId, node_b: NodeId, port: u16) -> Result<()> {
        self.ports.set(node_a, node_b, port)
    }

    /// Submit a configuration change built from the given candidate document.
    ///
    /// Resolves once the change has been committed cluster wide, or rejected or aborted
    /// with the first error code seen.
    pub async fn request_change(&self, document: ConfigDocument) -> Result<::std::result::Result<(), ConfigError>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCtlMsg::RequestChange { document, tx })
            .await
            .context("error submitting change request")?;
        rx.await.context("error awaiting change request outcome")
    }

    /// Fetch the coordinator's current status.
    pub async fn status(&self) -> Result<CoordinatorStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(CoordinatorCtlMsg::Status { tx }).await.context("error submitting status request")?;
        rx.await.context("error awaiting status")
    }
}

/// The driving state of one in-flight configuration change.
enum ChangeState {
    /// No change is being driven by this node.
    Idle,
    /// Prepares are being sent one node at a time in ascending node ID order.
    Preparing {
        /// The change context.
        ctx: ChangeCtx,
        /// The node whose prepare reply is awaited.
        awaiting: NodeId,
    },
    /// Commits have been broadcast to all contacted nodes.
    Committing {
        /// The change context.
        ctx: ChangeCtx,
        /// Nodes whose commit acknowledgement is awaited.
        pending: BTreeSet<NodeId>,
    },
    /// Aborts have been broadcast to all contacted nodes.
    Aborting {
        /// The change context.
        ctx: ChangeCtx,
        /// Nodes whose abort acknowledgement is awaited.
        pending: BTreeSet<NodeId>,
        /// The first error code seen, delivered to the requester once the wait drains.
        error: ConfigError,
    },
}

/// The context of one in-flight configuration change driven by this node.
struct ChangeCtx {
    /// A unique ID for tracing this change attempt.
    id: Uuid,
    /// The candidate document being agreed upon.
    document: Arc<ConfigDocument>,
    /// A bool marking the initial, generation 0 to 1, case.
    initial: bool,
    /// The management nodes this change must be prepared on.
    targets: BTreeSet<NodeId>,
    /// Nodes which have acknowledged a Prepare for this change. Grows monotonically while
    /// preparing; a Commit is only ever sent to members of this set.
    contacted: BTreeSet<NodeId>,
    /// The identity of whoever requested this change.
    requester: Requester,
}

/// The identity of whoever requested an in-flight change.
enum Requester {
    /// The change was initiated by this node itself.
    None,
    /// The change was requested over the local administrative surface.
    Local(oneshot::Sender<::std::result::Result<(), ConfigError>>),
    /// The change was requested by a peer node.
    Peer(NodeId),
}

/// A staged change this node is participating in.
struct StagedChange {
    /// The staged candidate document, applied only as a direct result of Commit.
    document: Arc<ConfigDocument>,
    /// The node coordinating the change.
    from: NodeId,
}
