//! Consistency checking gossip.
//!
//! Outside of an active change, every node periodically compares its `(protocol state,
//! generation, checksum)` triple against each connected management peer. Disagreements on
//! checksum are broken deterministically by node ID: the numerically higher side retries
//! while the lower side treats the divergence as fatal. A confirmed node which learns of a
//! strictly higher confirmed generation has missed a committed change and cannot safely
//! continue. The one repair performed silently is the bootstrap accommodation, where an
//! initial node adopts a peer's confirmed generation 1 document when the contents match.

use std::sync::Arc;

use anyhow::anyhow;

use super::{ChangeState, CoordinatorCtl, METRIC_CHECK_FAILURES};
use crate::error::ConfigError;
use crate::model::{ConfigDocument, ProtocolState};
use crate::network::PeerMessage;
use crate::NodeId;

impl CoordinatorCtl {
    /// Send a consistency check to every connected management peer.
    ///
    /// Checks are fire and forget with this periodic resend as the retry bound, so a hung
    /// peer can never stall the coordinator.
    pub(super) fn run_consistency_checks(&mut self) {
        if !matches!(self.change, ChangeState::Idle) || self.staged.is_some() {
            return;
        }
        let peers: Vec<NodeId> = self.connected.iter().copied().filter(|node| self.mgmt_nodes.contains(node)).collect();
        for node in peers {
            self.send_check_to(node);
        }
    }

    /// Send a consistency check to the given peer.
    pub(super) fn send_check_to(&self, node: NodeId) {
        let current = match &self.current {
            Some(current) => current,
            None => return,
        };
        if self.state == ProtocolState::Uninitialized {
            return;
        }
        let msg = PeerMessage::CheckRequest {
            state: self.state,
            generation: current.generation,
            checksum: current.checksum(),
        };
        if let Err(err) = self.send_peer(node, msg) {
            tracing::warn!(error = ?err, node, "error sending consistency check");
        }
    }

    /// Compare a peer's reported state against the local state and reply.
    #[tracing::instrument(level = "trace", skip(self, state, generation, checksum))]
    pub(super) fn handle_check_request(&mut self, from: NodeId, state: ProtocolState, generation: u64, checksum: u64) {
        let current = match self.current.clone() {
            Some(current) => current,
            None => {
                self.reply_check_ref(from, ConfigError::WrongState, generation, 0, state, ProtocolState::Uninitialized, None);
                return;
            }
        };
        let (lstate, lgen, lsum) = (self.state, current.generation, current.checksum());

        if state != lstate {
            // A confirmed node answering an initial peer includes its document while it
            // still carries the initial generation, letting the peer adopt it directly.
            let document = if lstate == ProtocolState::Confirmed && state == ProtocolState::Initial && lgen == 1 {
                Some((*current).clone())
            } else {
                None
            };
            self.reply_check_ref(from, ConfigError::WrongState, generation, lgen, state, lstate, document);
            return;
        }

        if generation != lgen {
            self.reply_check_ref(from, ConfigError::WrongGeneration, generation, lgen, state, lstate, None);
            if lstate == ProtocolState::Confirmed && generation > lgen {
                // The peer has committed a change this node never saw.
                self.fatal(anyhow!(
                    "node {} reports confirmed generation {} while this node holds generation {}, a committed configuration change was missed",
                    from,
                    generation,
                    lgen,
                ));
            }
            return;
        }

        if checksum != lsum {
            self.reply_check_ref(from, ConfigError::WrongChecksum, generation, lgen, state, lstate, None);
            // The lower node ID side of a checksum disagreement exits, the higher retries.
            if self.id < from {
                self.fatal(anyhow!("node {} reports a different configuration checksum at generation {}", from, generation));
            }
            return;
        }

        let reply = PeerMessage::CheckConf { state: lstate, generation: lgen };
        if let Err(err) = self.send_peer(from, reply) {
            tracing::warn!(error = ?err, from, "error replying to consistency check");
        }
    }

    /// Handle an agreeing consistency check reply.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_check_conf(&mut self, from: NodeId) {
        self.checked.insert(from);
        self.maybe_start_initial_change().await;
    }

    /// Handle a refused consistency check reply.
    #[tracing::instrument(level = "trace", skip(self, expected_generation, expected_state, document))]
    pub(super) async fn handle_check_ref(
        &mut self, from: NodeId, error: ConfigError, expected_generation: u64, expected_state: ProtocolState, document: Option<ConfigDocument>,
    ) {
        metrics::counter!(METRIC_CHECK_FAILURES, 1);
        match error {
            ConfigError::WrongState => self.handle_check_wrong_state(from, expected_state, document).await,
            ConfigError::WrongChecksum => {
                if self.id < from {
                    self.fatal(anyhow!("node {} refused a consistency check, configuration checksums diverge", from));
                } else {
                    tracing::warn!(from, "configuration checksums diverge, will retry the consistency check");
                }
            }
            ConfigError::WrongGeneration => {
                let lgen = self.current.as_ref().map(|doc| doc.generation).unwrap_or(0);
                if self.state == ProtocolState::Confirmed && expected_generation > lgen {
                    self.fatal(anyhow!(
                        "node {} holds confirmed generation {} while this node holds generation {}, a committed configuration change was missed",
                        from,
                        expected_generation,
                        lgen,
                    ));
                } else {
                    tracing::warn!(from, expected_generation, "consistency check refused for generation mismatch");
                }
            }
            _ => tracing::warn!(from, error = %error, "consistency check refused"),
        }
    }

    /// Handle a state mismatch reply, adopting the peer's confirmed document when this node
    /// is a late joiner of a cluster which confirmed the same initial configuration.
    async fn handle_check_wrong_state(&mut self, from: NodeId, expected_state: ProtocolState, document: Option<ConfigDocument>) {
        if self.state != ProtocolState::Initial || expected_state != ProtocolState::Confirmed {
            tracing::warn!(from, "consistency check refused for protocol state mismatch");
            return;
        }
        if self.staged.is_some() || !matches!(self.change, ChangeState::Idle) {
            // A change already in flight will resolve the state mismatch.
            return;
        }
        let document = match document {
            Some(document) => document,
            None => {
                tracing::warn!(from, "peer is confirmed beyond the initial generation, operator intervention required");
                return;
            }
        };
        let current = match self.current.clone() {
            Some(current) => current,
            None => return,
        };
        if document.initial_fingerprint() != current.initial_fingerprint() {
            return self.fatal(anyhow!("the confirmed configuration of node {} differs from this node's initial configuration", from));
        }
        // Adopt the already confirmed document directly rather than re-running a cluster
        // wide change the rest of the cluster has already completed.
        tracing::info!(from, generation = document.generation, "adopting the confirmed configuration from peer");
        if let Err(err) = self.store.stage(&document).await {
            return self.fatal(err.context("error staging adopted configuration"));
        }
        if let Err(err) = self.store.commit().await {
            return self.fatal(err.context("error committing adopted configuration"));
        }
        self.apply_document(Arc::new(document));
    }

    /// Reply to a consistency check with a refusal.
    #[allow(clippy::too_many_arguments)]
    fn reply_check_ref(
        &mut self, from: NodeId, error: ConfigError, generation: u64, expected_generation: u64, state: ProtocolState, expected_state: ProtocolState,
        document: Option<ConfigDocument>,
    ) {
        metrics::counter!(METRIC_CHECK_FAILURES, 1);
        tracing::warn!(from, error = %error, "consistency check refused");
        let msg = PeerMessage::CheckRef {
            error,
            generation,
            expected_generation,
            state,
            expected_state,
            document,
        };
        if let Err(err) = self.send_peer(from, msg) {
            tracing::warn!(error = ?err, from, "error replying to consistency check");
        }
    }
}
