//! Initiator side of the change protocol.
//!
//! The coordinating node sends Prepares one node at a time in ascending node ID order,
//! broadcasts Commit only to nodes which acknowledged a Prepare, and broadcasts Abort on
//! any rejection or transport failure. The local node participates in its own change
//! through the loopback queue so disk staging is uniform across all nodes.

use std::collections::BTreeSet;

use uuid::Uuid;

use super::{ChangeCtx, ChangeState, CoordinatorCtl, Requester, METRIC_CHANGES_ABORTED, METRIC_CHANGES_COMMITTED};
use crate::error::ConfigError;
use crate::model::{ConfigDocument, NodeKind, ProtocolState};
use crate::network::PeerMessage;
use crate::NodeId;

impl CoordinatorCtl {
    /// Handle a configuration change request from a client or peer.
    #[tracing::instrument(level = "trace", skip(self, document, requester))]
    pub(super) async fn handle_change_request(&mut self, mut document: ConfigDocument, requester: Requester) {
        let current = match (self.state, &self.current) {
            (ProtocolState::Uninitialized, _) | (_, None) => return self.respond_requester(requester, Err(ConfigError::NoConfigData)),
            (ProtocolState::Initial, _) => return self.respond_requester(requester, Err(ConfigError::IllegalInitialState)),
            (ProtocolState::Confirmed, Some(current)) => current.clone(),
        };
        if !matches!(self.change, ChangeState::Idle) || self.staged.is_some() {
            return self.respond_requester(requester, Err(ConfigError::ChangeAlreadyInProgress));
        }
        if self.initiator_id() != self.id {
            return self.respond_requester(requester, Err(ConfigError::NotMaster));
        }
        if !self.all_peers_ready() {
            return self.respond_requester(requester, Err(ConfigError::NotAllStarted));
        }
        if document.validate().is_err() {
            return self.respond_requester(requester, Err(ConfigError::IllegalConfigChange));
        }
        match document.node(self.id) {
            Some(node) if matches!(node.kind, NodeKind::Management { .. }) => (),
            _ => return self.respond_requester(requester, Err(ConfigError::IllegalConfigChange)),
        }
        // The coordinator assigns the successor generation; requesters submit content only.
        document.generation = current.generation + 1;
        self.begin_change(document, false, requester).await;
    }

    /// Start the initial configuration change if this node is the designated initiator and
    /// every management node is connected and consistency checked.
    pub(super) async fn maybe_start_initial_change(&mut self) {
        if self.state != ProtocolState::Initial || !matches!(self.change, ChangeState::Idle) || self.staged.is_some() {
            return;
        }
        let current = match &self.current {
            Some(current) => current.clone(),
            None => return,
        };
        if self.initiator_id() != self.id || !self.all_peers_ready() {
            return;
        }
        let mut candidate = (*current).clone();
        candidate.generation = 1;
        tracing::info!("all management nodes connected and checked, initiating the initial configuration change");
        self.begin_change(candidate, true, Requester::None).await;
    }

    /// Begin driving the given candidate through the prepare phase.
    async fn begin_change(&mut self, document: ConfigDocument, initial: bool, requester: Requester) {
        let mut targets = document.management_node_ids();
        targets.retain(|id| !self.config.no_wait_nodes.contains(id));
        let ctx = ChangeCtx {
            id: Uuid::new_v4(),
            document: std::sync::Arc::new(document),
            initial,
            targets,
            contacted: BTreeSet::new(),
            requester,
        };
        tracing::info!(change = %ctx.id, generation = ctx.document.generation, initial, "beginning configuration change");
        self.change = ChangeState::Preparing { awaiting: self.id, ctx };
        self.continue_preparing().await;
    }

    /// Send the Prepare to the next uncontacted target, or move to commit once all targets
    /// have been contacted.
    async fn continue_preparing(&mut self) {
        let ctx = match std::mem::replace(&mut self.change, ChangeState::Idle) {
            ChangeState::Preparing { ctx, .. } => ctx,
            other => {
                self.change = other;
                return;
            }
        };
        let next = match ctx.targets.iter().copied().find(|id| !ctx.contacted.contains(id)) {
            Some(next) => next,
            None => return self.begin_commit(ctx).await,
        };
        let msg = PeerMessage::PrepareRequest {
            document: (*ctx.document).clone(),
            initial: ctx.initial,
        };
        match self.send_peer(next, msg) {
            Ok(()) => self.change = ChangeState::Preparing { awaiting: next, ctx },
            Err(err) => {
                tracing::warn!(change = %ctx.id, error = ?err, node = next, "transport failure sending prepare, aborting change");
                self.begin_abort(ctx, ConfigError::PrepareFailed).await;
            }
        }
    }

    /// Handle a Prepare acknowledgement from the awaited node.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_prepare_conf(&mut self, from: NodeId) {
        match &mut self.change {
            ChangeState::Preparing { ctx, awaiting } if *awaiting == from => {
                ctx.contacted.insert(from);
            }
            _ => {
                tracing::warn!(from, "stray prepare confirmation");
                return;
            }
        }
        self.continue_preparing().await;
    }

    /// Handle a Prepare rejection, aborting the change.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_prepare_ref(&mut self, from: NodeId, error: ConfigError) {
        let ctx = match std::mem::replace(&mut self.change, ChangeState::Idle) {
            ChangeState::Preparing { ctx, awaiting } if awaiting == from => ctx,
            other => {
                self.change = other;
                tracing::warn!(from, error = %error, "stray prepare rejection");
                return;
            }
        };
        tracing::warn!(change = %ctx.id, from, error = %error, "prepare rejected, aborting change");
        self.begin_abort(ctx, error).await;
    }

    /// Broadcast Commit to every contacted node and await their acknowledgements.
    async fn begin_commit(&mut self, ctx: ChangeCtx) {
        tracing::debug!(change = %ctx.id, "all management nodes prepared, committing");
        let mut pending = ctx.contacted.clone();
        let mut unreachable = Vec::new();
        for node in pending.iter().copied() {
            if let Err(err) = self.send_peer(node, PeerMessage::CommitRequest) {
                if node == self.id {
                    // With the commit decided, failure to reach the local participant leaves
                    // no way to keep disk and memory in agreement.
                    return self.fatal(err.context("error delivering commit to the local participant"));
                }
                tracing::warn!(change = %ctx.id, error = ?err, node, "transport failure sending commit, excluding node from the commit wait");
                unreachable.push(node);
            }
        }
        for node in unreachable {
            pending.remove(&node);
        }
        if pending.is_empty() {
            return self.finish_commit(ctx);
        }
        self.change = ChangeState::Committing { ctx, pending };
    }

    /// Handle a Commit acknowledgement.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_commit_conf(&mut self, from: NodeId) {
        let (ctx, mut pending) = match std::mem::replace(&mut self.change, ChangeState::Idle) {
            ChangeState::Committing { ctx, pending } => (ctx, pending),
            other => {
                self.change = other;
                tracing::warn!(from, "stray commit confirmation");
                return;
            }
        };
        pending.remove(&from);
        if !pending.is_empty() {
            self.change = ChangeState::Committing { ctx, pending };
            return;
        }
        self.finish_commit(ctx);
    }

    /// Finalize a committed change and reply to the requester.
    fn finish_commit(&mut self, ctx: ChangeCtx) {
        tracing::info!(change = %ctx.id, generation = ctx.document.generation, "configuration change committed cluster wide");
        metrics::counter!(METRIC_CHANGES_COMMITTED, 1);
        self.respond_requester(ctx.requester, Ok(()));
        self.change = ChangeState::Idle;
    }

    /// Broadcast Abort to every contacted node, the local participant included, and await
    /// their acknowledgements.
    async fn begin_abort(&mut self, ctx: ChangeCtx, error: ConfigError) {
        metrics::counter!(METRIC_CHANGES_ABORTED, 1);
        let mut pending = ctx.contacted.clone();
        // The local participant discards its staged file even when it was never contacted.
        pending.insert(self.id);
        let mut unreachable = Vec::new();
        for node in pending.iter().copied() {
            if let Err(err) = self.send_peer(node, PeerMessage::AbortRequest) {
                tracing::warn!(change = %ctx.id, error = ?err, node, "transport failure sending abort, treating node as acknowledged");
                unreachable.push(node);
            }
        }
        for node in unreachable {
            pending.remove(&node);
        }
        if pending.is_empty() {
            return self.finish_abort(ctx, error);
        }
        self.change = ChangeState::Aborting { ctx, pending, error };
    }

    /// Handle an Abort acknowledgement.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_abort_conf(&mut self, from: NodeId) {
        let (ctx, mut pending, error) = match std::mem::replace(&mut self.change, ChangeState::Idle) {
            ChangeState::Aborting { ctx, pending, error } => (ctx, pending, error),
            other => {
                self.change = other;
                tracing::warn!(from, "stray abort confirmation");
                return;
            }
        };
        pending.remove(&from);
        if !pending.is_empty() {
            self.change = ChangeState::Aborting { ctx, pending, error };
            return;
        }
        self.finish_abort(ctx, error);
    }

    /// Finalize an aborted change, dropping the pending document and replying to the
    /// requester with the first error code seen.
    fn finish_abort(&mut self, ctx: ChangeCtx, error: ConfigError) {
        tracing::warn!(change = %ctx.id, error = %error, "configuration change aborted");
        self.respond_requester(ctx.requester, Err(error));
        self.change = ChangeState::Idle;
    }

    /// Handle the loss of a management peer, unwinding any protocol step waiting on it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_peer_disconnected(&mut self, node: NodeId) {
        tracing::debug!(node, "management peer disconnected");
        self.connected.remove(&node);
        self.checked.remove(&node);
        match std::mem::replace(&mut self.change, ChangeState::Idle) {
            ChangeState::Idle => {
                if let Some(staged) = &self.staged {
                    if staged.from == node {
                        // Deliberate limitation: no takeover of the coordinating role is
                        // attempted, further changes stay blocked by the staged file.
                        tracing::error!(
                            node,
                            "the coordinating node failed during an in-flight configuration change; \
                             the staged change is retained and further changes are blocked until resolved manually",
                        );
                    }
                }
            }
            ChangeState::Preparing { ctx, awaiting } => {
                if ctx.targets.contains(&node) {
                    tracing::warn!(change = %ctx.id, node, "management node failed during prepare, aborting change");
                    self.begin_abort(ctx, ConfigError::PrepareFailed).await;
                } else {
                    self.change = ChangeState::Preparing { ctx, awaiting };
                }
            }
            ChangeState::Committing { ctx, mut pending } => {
                if pending.remove(&node) {
                    tracing::warn!(change = %ctx.id, node, "management node failed during the commit wait, excluding it");
                }
                if pending.is_empty() {
                    self.finish_commit(ctx);
                } else {
                    self.change = ChangeState::Committing { ctx, pending };
                }
            }
            ChangeState::Aborting { ctx, mut pending, error } => {
                // A failed node is treated as having acknowledged the abort.
                pending.remove(&node);
                if pending.is_empty() {
                    self.finish_abort(ctx, error);
                } else {
                    self.change = ChangeState::Aborting { ctx, pending, error };
                }
            }
        }
    }
}
