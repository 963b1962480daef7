//! Configuration document model.
//!
//! A `ConfigDocument` is an immutable value describing the whole cluster: node definitions
//! and connection definitions, versioned by a monotonically increasing generation. A change
//! always produces a new document; the active document is only ever swapped wholesale by the
//! change coordinator, and readers receive shared read-only snapshots.


use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::NodeId;

/// The value substituted for the cluster name when computing checksums.
///
/// Checksums must be insensitive to the administrative identity fields, so that nodes can
/// compare configuration content independent of cluster naming and primary node selection.
const CHECKSUM_NAME_MASK: &str = "<cluster>";

/// The lifecycle of a node's relationship to a confirmed configuration.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    /// The node holds no configuration data at all.
    Uninitialized,
    /// The node holds an operator provided initial document which the cluster has not confirmed.
    Initial,
    /// The node holds a cluster confirmed document.
    Confirmed,
}

/// A versioned, checksummable description of the whole cluster's configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfigDocument {
    /// The generation of this document, `0` being reserved for unconfirmed initial documents.
    pub generation: u64,
    /// The name of the cluster, identical across all nodes once confirmed.
    pub cluster_name: String,
    /// The management node treated as primary for operator edited configuration files.
    pub primary_node_id: NodeId,
    /// The typed sections of the document.
    pub sections: Vec<Section>,
}

/// A typed section of a configuration document.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "section", rename_all = "snake_case")]
pub enum Section {
    /// A node definition.
    Node(NodeSection),
    /// A connection definition between a pair of nodes.
    Connection(ConnectionSection),
}

/// A node definition.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeSection {
    /// The ID of the node.
    pub node_id: NodeId,
    /// The role of the node within the cluster.
    pub kind: NodeKind,
    /// The hostname on which the node runs.
    pub hostname: String,
}

/// The role of a node within the cluster.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum NodeKind {
    /// A management node, along with the port on which it serves peer traffic.
    Management { port: u16 },
    /// A data node.
    Data,
    /// A client node.
    Client,
}

/// A connection definition between a pair of nodes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConnectionSection {
    /// The first endpoint of the connection.
    pub node_a: NodeId,
    /// The second endpoint of the connection.
    pub node_b: NodeId,
    /// The port of the connection. Negative values mark the port as dynamically negotiated
    /// at connection time, to be overlaid from the dynamic port registry when served.
    pub port: i32,
}

impl ConfigDocument {
    /// Load and validate a configuration document from an operator provided file.
    ///
    /// Operator files describe initial documents and must carry generation `0`.
    pub async fn from_file(path: &str) -> Result<Self> {
        let buf = tokio::fs::read(path).await.with_context(|| format!("error reading configuration file {}", path))?;
        let doc: Self = serde_json::from_slice(&buf).with_context(|| format!("error parsing configuration file {}", path))?;
        if doc.generation != 0 {
            bail!("configuration file {} carries generation {}, operator files must carry generation 0", path, doc.generation);
        }
        doc.validate().with_context(|| format!("invalid configuration file {}", path))?;
        Ok(doc)
    }

    /// Validate the structure of this document.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            bail!("cluster name must not be empty");
        }
        let mut node_ids = BTreeSet::new();
        for section in &self.sections {
            if let Section::Node(node) = section {
                if node.node_id == 0 {
                    bail!("node IDs start at 1");
                }
                if !node_ids.insert(node.node_id) {
                    bail!("duplicate node definition for node {}", node.node_id);
                }
            }
        }
        for section in &self.sections {
            if let Section::Connection(conn) = section {
                if conn.node_a == conn.node_b {
                    bail!("connection section references node {} on both sides", conn.node_a);
                }
                for id in [conn.node_a, conn.node_b] {
                    if !node_ids.contains(&id) {
                        bail!("connection section references undefined node {}", id);
                    }
                }
            }
        }
        match self.node(self.primary_node_id) {
            Some(node) if matches!(node.kind, NodeKind::Management { .. }) => (),
            Some(_) => bail!("primary node {} is not a management node", self.primary_node_id),
            None => bail!("primary node {} is not defined in the document", self.primary_node_id),
        }
        Ok(())
    }

    /// The checksum of this document.
    ///
    /// Computed over a normalized copy with the administrative identity fields masked, so two
    /// documents with differing cluster names or primary node selections but identical content
    /// compare equal.
    pub fn checksum(&self) -> u64 {
        let mut normalized = self.clone();
        normalized.cluster_name = CHECKSUM_NAME_MASK.into();
        normalized.primary_node_id = 0;
        hash_document(&normalized)
    }

    /// The fingerprint of this document's content, independent of generation.
    ///
    /// Used for the "equal modulo administrative fields" comparisons of the initial exchange,
    /// where an unconfirmed generation 0 document is compared against its generation 1
    /// candidate or confirmed counterpart.
    pub fn initial_fingerprint(&self) -> u64 {
        let mut normalized = self.clone();
        normalized.generation = 0;
        normalized.cluster_name = CHECKSUM_NAME_MASK.into();
        normalized.primary_node_id = 0;
        hash_document(&normalized)
    }

    /// Look up the node section for the given node ID.
    pub fn node(&self, id: NodeId) -> Option<&NodeSection> {
        self.sections.iter().find_map(|section| match section {
            Section::Node(node) if node.node_id == id => Some(node),
            _ => None,
        })
    }

    /// A bool indicating if the given node is defined as a data node.
    pub fn is_data_node(&self, id: NodeId) -> bool {
        matches!(self.node(id), Some(node) if matches!(node.kind, NodeKind::Data))
    }

    /// The set of all management node IDs defined in this document.
    pub fn management_node_ids(&self) -> BTreeSet<NodeId> {
        self.sections
            .iter()
            .filter_map(|section| match section {
                Section::Node(node) if matches!(node.kind, NodeKind::Management { .. }) => Some(node.node_id),
                _ => None,
            })
            .collect()
    }

    /// The peer addresses of all management nodes defined in this document.
    pub fn management_node_addrs(&self) -> HashMap<NodeId, String> {
        self.sections
            .iter()
            .filter_map(|section| match section {
                Section::Node(node) => match node.kind {
                    NodeKind::Management { port } => Some((node.node_id, format!("{}:{}", node.hostname, port))),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    /// Check a candidate document for structural compatibility against the current document.
    ///
    /// A candidate may not remove a node section present in the current document, nor change
    /// the role of a retained node. This catches operator errors such as deleting mandatory
    /// sections before they reach the durable staging layer.
    pub fn check_compatible(current: &Self, candidate: &Self) -> Result<(), ConfigError> {
        for section in &current.sections {
            let node = match section {
                Section::Node(node) => node,
                Section::Connection(_) => continue,
            };
            match candidate.node(node.node_id) {
                None => return Err(ConfigError::IllegalConfigChange),
                Some(retained) if std::mem::discriminant(&retained.kind) != std::mem::discriminant(&node.kind) => {
                    return Err(ConfigError::IllegalConfigChange)
                }
                Some(_) => (),
            }
        }
        Ok(())
    }
}

/// Hash the canonical encoding of the given document.
fn hash_document(doc: &ConfigDocument) -> u64 {
    // Serialization of a well-formed document cannot fail, and the field order of the
    // canonical encoding is fixed by the struct definitions.
    let buf = serde_json::to_vec(doc).unwrap_or_default();
    seahash::hash(&buf)
}
