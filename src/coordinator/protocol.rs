//! Participant side of the change protocol.
//!
//! Every management node validates and durably stages candidates on Prepare, applies the
//! staged candidate only as a direct result of Commit, and discards it on Abort. A node
//! which has acknowledged a Prepare must be able to honor Commit; any failure to do so is
//! fatal by design, because disk and memory must never disagree about a decided outcome.

use std::sync::Arc;

use anyhow::anyhow;

use super::{ChangeState, CoordinatorCtl, StagedChange};
use crate::error::ConfigError;
use crate::model::{ConfigDocument, ProtocolState};
use crate::network::PeerMessage;
use crate::NodeId;

impl CoordinatorCtl {
    /// Handle a request to durably stage the given candidate without applying it.
    #[tracing::instrument(level = "trace", skip(self, document, initial))]
    pub(super) async fn handle_prepare(&mut self, from: NodeId, document: ConfigDocument, initial: bool) {
        let reply = match self.validate_prepare(from, &document, initial) {
            Err(error) => {
                tracing::warn!(from, error = %error, "rejecting prepare");
                PeerMessage::PrepareRef { error }
            }
            Ok(()) => match self.store.stage(&document).await {
                Err(err) => {
                    tracing::error!(error = ?err, "error staging candidate configuration");
                    PeerMessage::PrepareRef { error: ConfigError::PrepareFailed }
                }
                Ok(()) => {
                    tracing::debug!(from, generation = document.generation, "candidate configuration staged");
                    self.staged = Some(StagedChange { document: Arc::new(document), from });
                    PeerMessage::PrepareConf
                }
            },
        };
        if let Err(err) = self.send_peer(from, reply) {
            tracing::warn!(error = ?err, from, "error replying to prepare");
        }
    }

    /// Validate a Prepare against the local state and the current document.
    fn validate_prepare(&self, from: NodeId, candidate: &ConfigDocument, initial: bool) -> ::std::result::Result<(), ConfigError> {
        if self.staged.is_some() {
            return Err(ConfigError::ChangeAlreadyInProgress);
        }
        // The node driving a change accepts its own loopback Prepare while driving.
        if !matches!(self.change, ChangeState::Idle) && from != self.id {
            return Err(ConfigError::ChangeAlreadyInProgress);
        }
        let current = match &self.current {
            Some(current) => current,
            None => return Err(ConfigError::NoConfigData),
        };
        ConfigDocument::check_compatible(current, candidate)?;
        if initial {
            if self.state != ProtocolState::Initial {
                return Err(ConfigError::IllegalInitialState);
            }
            if candidate.generation != 1 {
                return Err(ConfigError::IllegalInitialGeneration);
            }
            if from != self.id && candidate.initial_fingerprint() != current.initial_fingerprint() {
                return Err(ConfigError::DifferentInitial);
            }
            return Ok(());
        }
        if self.state != ProtocolState::Confirmed {
            return Err(ConfigError::IllegalInitialState);
        }
        if candidate.primary_node_id != current.primary_node_id {
            return Err(ConfigError::NotPrimaryManagementNode);
        }
        if candidate.generation != current.generation + 1 {
            return Err(ConfigError::InvalidGeneration);
        }
        if candidate.cluster_name != current.cluster_name {
            return Err(ConfigError::InvalidConfigName);
        }
        Ok(())
    }

    /// Handle a request to apply the staged candidate.
    ///
    /// Failure here terminates the process rather than silently diverging.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_commit(&mut self, from: NodeId) {
        let staged = match self.staged.take() {
            Some(staged) => staged,
            None => return self.fatal(anyhow!("commit received from node {} with no staged configuration change", from)),
        };
        if let Err(err) = self.store.commit().await {
            return self.fatal(err.context("error committing staged configuration, disk and memory must not diverge"));
        }
        self.apply_document(staged.document);
        if let Err(err) = self.send_peer(from, PeerMessage::CommitConf) {
            tracing::warn!(error = ?err, from, "error replying to commit");
        }
    }

    /// Handle a request to discard the staged candidate. Idempotent.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_abort(&mut self, from: NodeId) {
        if let Err(err) = self.store.abort().await {
            // Any residue will resurface as a staging failure on the next change.
            tracing::error!(error = ?err, "error removing staged configuration during abort");
        }
        self.staged = None;
        if let Err(err) = self.send_peer(from, PeerMessage::AbortConf) {
            tracing::warn!(error = ?err, from, "error replying to abort");
        }
    }
}
