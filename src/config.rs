//! Runtime configuration.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::NodeId;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The ID of this management node within the cluster.
    pub node_id: NodeId,
    /// The port which cluster internal network traffic is to use.
    pub server_port: u16,

    /// The path to the configuration storage directory on disk.
    #[serde(default = "crate::storage::default_data_path")]
    pub storage_data_path: String,
    /// The path to the operator provided initial configuration file, if any.
    #[serde(default)]
    pub config_file: Option<String>,

    /// The interval in seconds on which peer consistency checks are run.
    #[serde(default = "Config::default_check_interval")]
    pub check_interval_seconds: u64,
    /// Management node IDs which are never waited upon, given as a comma separated list.
    #[serde(default, deserialize_with = "Config::parse_node_set")]
    pub no_wait_nodes: BTreeSet<NodeId>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        if config.node_id == 0 {
            anyhow::bail!("invalid NODE_ID, node IDs start at 1");
        }
        Ok(config)
    }

    /// The default interval in seconds on which peer consistency checks are run.
    fn default_check_interval() -> u64 {
        2
    }

    /// Parse a comma separated list of node IDs from the config source.
    fn parse_node_set<'de, D: Deserializer<'de>>(val: D) -> Result<BTreeSet<NodeId>, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse().map_err(|err| DeError::custom(format!("invalid node ID '{}': {}", part, err))))
            .collect()
    }
}

#[cfg(test)]
impl Config {
    /// Create a new config instance for testing, backed by a temp storage dir.
    pub fn new_test(node_id: NodeId) -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating temp dir")?;
        let config = Self {
            rust_log: "error".into(),
            node_id,
            server_port: 7700,
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            config_file: None,
            check_interval_seconds: 1,
            no_wait_nodes: Default::default(),
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
