//! Error abstractions for the configuration protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Error messages.
pub const ERR_STAGING_WRITE: &str = "error writing staged configuration file";
pub const ERR_STAGING_FSYNC: &str = "error flushing staged configuration file to disk";

/// Configuration protocol error variants.
///
/// These codes travel on the wire inside rejection messages and are surfaced to the
/// original requester of a configuration change.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, Error)]
pub enum ConfigError {
    /// The receiving node is not the designated change initiator.
    #[error("the receiving node is not the designated configuration change initiator")]
    NotMaster,
    /// Not all management nodes are connected and checked for consistency.
    #[error("not all management nodes are connected and checked for consistency")]
    NotAllStarted,
    /// A configuration change is already in progress.
    #[error("a configuration change is already in progress")]
    ChangeAlreadyInProgress,
    /// The node holds no configuration data.
    #[error("the node holds no configuration data")]
    NoConfigData,
    /// A received payload could not be unpacked into a configuration message.
    #[error("a received payload could not be unpacked into a configuration message")]
    FailedToUnpack,
    /// The candidate configuration is structurally incompatible with the current one.
    #[error("the candidate configuration is structurally incompatible with the current configuration")]
    IllegalConfigChange,
    /// The node's protocol state does not permit an initial configuration change.
    #[error("the node's protocol state does not permit an initial configuration change")]
    IllegalInitialState,
    /// An initial configuration change must carry generation 1.
    #[error("an initial configuration change must carry generation 1")]
    IllegalInitialGeneration,
    /// The candidate initial configuration differs from this node's own initial configuration.
    #[error("the candidate initial configuration differs from this node's own initial configuration")]
    DifferentInitial,
    /// The candidate changes the primary management node of the configuration.
    #[error("the candidate changes the primary management node of the configuration")]
    NotPrimaryManagementNode,
    /// The candidate's generation is not the direct successor of the current generation.
    #[error("the candidate's generation is not the direct successor of the current generation")]
    InvalidGeneration,
    /// The candidate changes the cluster name of the configuration.
    #[error("the candidate changes the cluster name of the configuration")]
    InvalidConfigName,
    /// The candidate configuration could not be staged durably.
    #[error("the candidate configuration could not be staged durably")]
    PrepareFailed,
    /// The peers disagree on protocol state.
    #[error("the peers disagree on configuration protocol state")]
    WrongState,
    /// The peers disagree on configuration generation.
    #[error("the peers disagree on configuration generation")]
    WrongGeneration,
    /// The peers disagree on configuration checksum.
    #[error("the peers disagree on configuration checksum")]
    WrongChecksum,
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);
