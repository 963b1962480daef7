//! TCP transport connecting management node pairs.
//!
//! One connection exists per management node pair and the lower node ID dials it. Each
//! established connection runs a reader loop feeding reassembled messages into the
//! coordinator's queue, plus a writer task draining the pool's outbound queue for that
//! peer. Peer addresses are taken from the coordinator's published management addresses,
//! so a committed document change updates the dial targets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::coordinator::CoordinatorCtlMsg;
use crate::error::ConfigError;
use crate::fragment::FragmentReassembler;
use crate::network::{frame, PeerMessage, PeerNetwork};
use crate::NodeId;

/// The interval on which disconnected peers are redialed.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// The TCP peer pool.
#[derive(Clone)]
pub struct PeerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// The ID of this node in the cluster.
    id: NodeId,
    /// The application's runtime config.
    config: Arc<Config>,
    /// Outbound queues of connected peers.
    conns: DashMap<NodeId, mpsc::UnboundedSender<PeerMessage>>,
    /// Reassembly of inbound message fragments across all connections.
    reassembler: Mutex<FragmentReassembler>,
    /// The channel of management peer addresses published by the coordinator.
    peer_addrs: watch::Receiver<Arc<HashMap<NodeId, String>>>,
    /// The channel into the coordinator.
    coordinator_tx: mpsc::Sender<CoordinatorCtlMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl PeerPool {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, peer_addrs: watch::Receiver<Arc<HashMap<NodeId, String>>>, coordinator_tx: mpsc::Sender<CoordinatorCtlMsg>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            id: config.node_id,
            config,
            conns: DashMap::new(),
            reassembler: Mutex::new(FragmentReassembler::new()),
            peer_addrs,
            coordinator_tx,
            shutdown_tx,
        });
        Self { inner }
    }

    /// Spawn the listener and dialer loops of this pool.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let this = self.clone();
        tokio::spawn(this.run())
    }

    async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.inner.config.server_port);
        let listener = TcpListener::bind(&addr).await.with_context(|| format!("error binding peer listener on {}", addr))?;
        tracing::debug!(%addr, "peer listener is online");

        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let mut redial = tokio::time::interval(RECONNECT_INTERVAL);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, remote)) => self.spawn_accept(socket, remote),
                    Err(err) => tracing::warn!(error = ?err, "error accepting peer connection"),
                },
                _ = redial.tick() => self.dial_missing_peers(),
                _ = shutdown.recv() => break,
            }
        }

        tracing::debug!("peer pool has shutdown");
        Ok(())
    }

    /// Dial every published management peer this node is responsible for connecting to.
    fn dial_missing_peers(&self) {
        let addrs = self.inner.peer_addrs.borrow().clone();
        for (peer, addr) in addrs.iter() {
            // The lower node ID dials, so this node only dials upward.
            if *peer <= self.inner.id || self.inner.conns.contains_key(peer) {
                continue;
            }
            let (this, peer, addr) = (self.clone(), *peer, addr.clone());
            tokio::spawn(async move {
                if let Err(err) = this.dial_peer(peer, &addr).await {
                    tracing::debug!(error = ?err, peer, %addr, "management peer connection closed");
                }
            });
        }
    }

    async fn dial_peer(self, peer: NodeId, addr: &str) -> Result<()> {
        let mut socket = TcpStream::connect(addr).await.with_context(|| format!("error connecting to peer at {}", addr))?;
        send_handshake(&mut socket, self.inner.id).await?;
        let peer_id = read_handshake(&mut socket).await?;
        if peer_id != peer {
            bail!("peer at {} identified as node {} but node {} was expected", addr, peer_id, peer);
        }
        self.run_connection(peer, socket).await
    }

    fn spawn_accept(&self, socket: TcpStream, remote: std::net::SocketAddr) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.accept_peer(socket).await {
                tracing::debug!(error = ?err, %remote, "management peer connection closed");
            }
        });
    }

    async fn accept_peer(self, mut socket: TcpStream) -> Result<()> {
        let peer_id = read_handshake(&mut socket).await?;
        if peer_id >= self.inner.id {
            bail!("rejecting connection from node {}, connections are dialed by the lower node ID", peer_id);
        }
        send_handshake(&mut socket, self.inner.id).await?;
        self.run_connection(peer_id, socket).await
    }

    /// Run an established peer connection until it closes or shutdown is triggered.
    async fn run_connection(self, peer: NodeId, socket: TcpStream) -> Result<()> {
        let (tx, outbound) = mpsc::unbounded_channel();
        if self.inner.conns.insert(peer, tx).is_some() {
            tracing::warn!(peer, "replacing an existing connection to management peer");
        }
        let _ = self.inner.coordinator_tx.send(CoordinatorCtlMsg::PeerConnected { node: peer }).await;

        let (mut reader, writer) = socket.into_split();
        let writer_handle = tokio::spawn(write_loop(writer, outbound, self.inner.shutdown_tx.subscribe()));

        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let res = loop {
            tokio::select! {
                frame_res = frame::read_frame(&mut reader) => match frame_res {
                    Ok(frame) => {
                        if let Err(err) = self.deliver_frame(peer, frame).await {
                            break Err(err);
                        }
                    }
                    Err(err) => break Err(err),
                },
                _ = shutdown.recv() => break Ok(()),
            }
        };

        self.inner.conns.remove(&peer);
        if let Ok(mut reassembler) = self.inner.reassembler.lock() {
            // Partial messages from the failed connection must never be delivered.
            reassembler.on_node_failed(peer);
        }
        let _ = self.inner.coordinator_tx.send(CoordinatorCtlMsg::PeerDisconnected { node: peer }).await;
        writer_handle.abort();
        res
    }

    /// Feed a received frame through reassembly and deliver any completed message.
    async fn deliver_frame(&self, peer: NodeId, frame: frame::Frame) -> Result<()> {
        let assembled = {
            let mut reassembler = self.inner.reassembler.lock().map_err(|_| anyhow!("fragment reassembler lock poisoned"))?;
            reassembler.on_fragment(peer, frame.fragment_id, frame.first, frame.last, &frame.data)?
        };
        let buf = match assembled {
            Some(buf) => buf,
            None => return Ok(()),
        };
        let msg: PeerMessage = match serde_json::from_slice(&buf) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error = ?err, peer, code = %ConfigError::FailedToUnpack, "error unpacking peer message, dropping connection");
                bail!(ConfigError::FailedToUnpack);
            }
        };
        self.inner
            .coordinator_tx
            .send(CoordinatorCtlMsg::Peer { from: peer, msg })
            .await
            .map_err(|_| anyhow!("coordinator queue closed"))?;
        Ok(())
    }
}

impl PeerNetwork for PeerPool {
    fn send(&self, target: NodeId, msg: PeerMessage) -> Result<()> {
        let conn = self.inner.conns.get(&target).ok_or_else(|| anyhow!("no active connection to node {}", target))?;
        conn.value().send(msg).map_err(|_| anyhow!("connection to node {} is closing", target))
    }
}

/// Drain a peer's outbound queue onto its connection, encoding messages as fragments.
async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<PeerMessage>, mut shutdown: broadcast::Receiver<()>) {
    let mut next_fragment_id = 0u64;
    loop {
        tokio::select! {
            msg_opt = outbound.recv() => {
                let msg = match msg_opt {
                    Some(msg) => msg,
                    None => break,
                };
                let buf = match serde_json::to_vec(&msg) {
                    Ok(buf) => buf,
                    Err(err) => {
                        tracing::error!(error = ?err, "error encoding peer message");
                        continue;
                    }
                };
                next_fragment_id += 1;
                if let Err(err) = frame::write_message(&mut writer, next_fragment_id, &buf).await {
                    tracing::debug!(error = ?err, "error writing to peer connection");
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Send the identifying handshake on a fresh connection.
async fn send_handshake(socket: &mut TcpStream, id: NodeId) -> Result<()> {
    let buf = serde_json::to_vec(&PeerMessage::Handshake { node_id: id }).context("error encoding handshake")?;
    frame::write_message(socket, 0, &buf).await
}

/// Read the peer's identifying handshake off a fresh connection.
async fn read_handshake(socket: &mut TcpStream) -> Result<NodeId> {
    let frame = frame::read_frame(socket).await?;
    if !(frame.first && frame.last) {
        bail!("handshake must be a single fragment");
    }
    match serde_json::from_slice(&frame.data).context("error decoding handshake")? {
        PeerMessage::Handshake { node_id } => Ok(node_id),
        other => bail!("expected a handshake, got {:?}", other),
    }
}
