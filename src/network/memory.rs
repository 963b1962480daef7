//! In-memory peer networks used by tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::coordinator::CoordinatorCtlMsg;
use crate::network::{PeerMessage, PeerNetwork};
use crate::NodeId;

/// An in-memory router delivering peer messages straight into coordinator queues.
#[derive(Default)]
pub struct MemoryNetwork {
    routes: Mutex<HashMap<NodeId, mpsc::Sender<CoordinatorCtlMsg>>>,
}

impl MemoryNetwork {
    /// Create a new instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node's inbound queue, returning its sending handle onto the network.
    pub fn register(self: &Arc<Self>, id: NodeId, tx: mpsc::Sender<CoordinatorCtlMsg>) -> Arc<MemoryPeer> {
        self.routes.lock().unwrap().insert(id, tx);
        Arc::new(MemoryPeer { from: id, net: self.clone() })
    }

    /// Drop a node's route, failing all subsequent sends to it.
    pub fn fail_node(&self, id: NodeId) {
        self.routes.lock().unwrap().remove(&id);
    }
}

/// One node's sending handle onto a `MemoryNetwork`.
pub struct MemoryPeer {
    from: NodeId,
    net: Arc<MemoryNetwork>,
}

impl PeerNetwork for MemoryPeer {
    fn send(&self, target: NodeId, msg: PeerMessage) -> Result<()> {
        let tx = self
            .net
            .routes
            .lock()
            .unwrap()
            .get(&target)
            .cloned()
            .ok_or_else(|| anyhow!("no route to node {}", target))?;
        tx.try_send(CoordinatorCtlMsg::Peer { from: self.from, msg })
            .map_err(|err| anyhow!("error delivering message to node {}: {}", target, err))
    }
}

/// A network sink recording outbound sends, for driving coordinator handlers directly.
#[derive(Default)]
pub struct RecordingNetwork {
    sent: Mutex<Vec<(NodeId, PeerMessage)>>,
}

impl RecordingNetwork {
    /// Create a new instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain all recorded sends.
    pub fn drain(&self) -> Vec<(NodeId, PeerMessage)> {
        self.sent.lock().unwrap().drain(..).collect()
    }
}

impl PeerNetwork for RecordingNetwork {
    fn send(&self, target: NodeId, msg: PeerMessage) -> Result<()> {
        self.sent.lock().unwrap().push((target, msg));
        Ok(())
    }
}
