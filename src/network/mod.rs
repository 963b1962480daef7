//! Peer networking.
//!
//! Management nodes exchange configuration protocol messages over one TCP connection per
//! node pair. Messages are encoded as tagged JSON values and carried as size limited
//! fragments (see `frame`), reassembled before decoding. The change coordinator is insulated
//! from the transport by the `PeerNetwork` trait so protocol logic can be driven against an
//! in-memory network in tests.

mod frame;
#[cfg(test)]
pub mod memory;
mod tcp;

pub use tcp::PeerPool;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{ConfigDocument, ProtocolState};
use crate::NodeId;

/// A configuration protocol message exchanged between management nodes.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Connection setup, identifying the sending node.
    Handshake {
        /// The ID of the sending node.
        node_id: NodeId,
    },
    /// A consistency check of the sender's configuration state.
    CheckRequest {
        /// The sender's protocol state.
        state: ProtocolState,
        /// The sender's configuration generation.
        generation: u64,
        /// The sender's configuration checksum.
        checksum: u64,
    },
    /// The checked states agree.
    CheckConf {
        /// The responder's protocol state.
        state: ProtocolState,
        /// The responder's configuration generation.
        generation: u64,
    },
    /// The checked states disagree.
    CheckRef {
        /// The specific disagreement.
        error: ConfigError,
        /// The generation carried by the check.
        generation: u64,
        /// The responder's generation.
        expected_generation: u64,
        /// The protocol state carried by the check.
        state: ProtocolState,
        /// The responder's protocol state.
        expected_state: ProtocolState,
        /// The responder's full confirmed document, included only for the bootstrap case
        /// where an initial node may adopt a confirmed generation 1 document directly.
        document: Option<ConfigDocument>,
    },
    /// A request to drive a configuration change to the given candidate.
    ChangeRequest {
        /// The candidate document.
        document: ConfigDocument,
    },
    /// The requested change was committed cluster wide.
    ChangeConf,
    /// The requested change was rejected or aborted.
    ChangeRef {
        /// The first error code seen while driving the change.
        error: ConfigError,
    },
    /// A request to durably stage the given candidate without applying it.
    PrepareRequest {
        /// The candidate document.
        document: ConfigDocument,
        /// A bool marking the initial, generation 0 to 1, case.
        initial: bool,
    },
    /// The candidate was staged durably.
    PrepareConf,
    /// The candidate was rejected.
    PrepareRef {
        /// The rejection code.
        error: ConfigError,
    },
    /// A request to apply the staged candidate.
    CommitRequest,
    /// The staged candidate was applied.
    CommitConf,
    /// A request to discard the staged candidate.
    AbortRequest,
    /// The staged candidate was discarded, or nothing was staged.
    AbortConf,
}

/// A seam between the change coordinator and the transport carrying its messages.
///
/// Sends are fire and forget: replies arrive back on the coordinator's inbound queue as
/// ordinary peer messages, keeping all waiting inside the coordinator's state machine.
pub trait PeerNetwork: Send + Sync + 'static {
    /// Send a message to the target management node.
    ///
    /// An error indicates the message could not be handed to the target's transport, which
    /// the coordinator treats as a transport failure for the protocol step in flight.
    fn send(&self, target: NodeId, msg: PeerMessage) -> anyhow::Result<()>;
}
