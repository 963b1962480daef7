use crate::model::{ConfigDocument, ConnectionSection, NodeKind, NodeSection, Section};
use crate::NodeId;

/// The data node ID used by the fixture documents.
pub const DATA_NODE: NodeId = 10;

/// Build a document with the given management nodes plus one data node wired to each of
/// them over a dynamic port connection.
pub fn cluster_doc(mgmt: &[NodeId], generation: u64) -> ConfigDocument {
    let mut sections: Vec<Section> = mgmt
        .iter()
        .map(|id| {
            Section::Node(NodeSection {
                node_id: *id,
                kind: NodeKind::Management { port: 7700 + *id as u16 },
                hostname: "localhost".into(),
            })
        })
        .collect();
    sections.push(Section::Node(NodeSection {
        node_id: DATA_NODE,
        kind: NodeKind::Data,
        hostname: "localhost".into(),
    }));
    for id in mgmt {
        sections.push(Section::Connection(ConnectionSection { node_a: *id, node_b: DATA_NODE, port: -1 }));
    }
    ConfigDocument {
        generation,
        cluster_name: "testcluster".into(),
        primary_node_id: mgmt.iter().copied().min().unwrap_or(1),
        sections,
    }
}

/// Build a variant of `cluster_doc` carrying one extra client node, for divergence tests.
pub fn diverged_cluster_doc(mgmt: &[NodeId], generation: u64) -> ConfigDocument {
    let mut doc = cluster_doc(mgmt, generation);
    doc.sections.push(Section::Node(NodeSection {
        node_id: 42,
        kind: NodeKind::Client,
        hostname: "localhost".into(),
    }));
    doc
}
