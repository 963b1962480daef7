//! Dynamic port registry.
//!
//! Connections flagged in the configuration document with a negative port value negotiate
//! their actual port at connection time. Those runtime assignments live here, outside the
//! generation versioned document, and are merged into a served copy of the document on
//! demand. The stored document is never mutated by this overlay.

use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;

use crate::model::{ConfigDocument, Section};
use crate::NodeId;

/// A table of runtime negotiated port assignments between node pairs.
///
/// Keys are normalized so `(a, b)` and `(b, a)` address the same entry. The registry is
/// shared with connection handlers which record negotiated ports without entering the
/// change coordinator.
#[derive(Clone, Default)]
pub struct DynamicPortRegistry {
    inner: Arc<DashMap<(NodeId, NodeId), u16>>,
}

impl DynamicPortRegistry {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the negotiated port for the given node pair.
    pub fn set(&self, node_a: NodeId, node_b: NodeId, port: u16) -> Result<()> {
        if node_a == node_b {
            bail!("dynamic port registration requires two distinct nodes, got {} on both sides", node_a);
        }
        self.inner.insert(Self::key(node_a, node_b), port);
        Ok(())
    }

    /// Fetch the negotiated port for the given node pair, if any.
    pub fn get(&self, node_a: NodeId, node_b: NodeId) -> Option<u16> {
        self.inner.get(&Self::key(node_a, node_b)).map(|entry| *entry.value())
    }

    /// Produce a served copy of the given document with registered dynamic ports substituted.
    ///
    /// Only connection sections carrying the dynamic sentinel where one side is a data node
    /// are overlaid. Sections without a registered assignment keep the sentinel.
    pub fn overlay(&self, doc: &ConfigDocument) -> ConfigDocument {
        let mut served = doc.clone();
        for section in served.sections.iter_mut() {
            let conn = match section {
                Section::Connection(conn) if conn.port < 0 => conn,
                _ => continue,
            };
            if !doc.is_data_node(conn.node_a) && !doc.is_data_node(conn.node_b) {
                continue;
            }
            if let Some(port) = self.get(conn.node_a, conn.node_b) {
                conn.port = i32::from(port);
            }
        }
        served
    }

    /// Normalize the given pair into its canonical key ordering.
    fn key(node_a: NodeId, node_b: NodeId) -> (NodeId, NodeId) {
        if node_a <= node_b {
            (node_a, node_b)
        } else {
            (node_b, node_a)
        }
    }
}
