use anyhow::Result;

use crate::fixtures;
use crate::model::{ConnectionSection, Section};
use crate::ports::DynamicPortRegistry;

#[test]
fn pair_keys_are_normalized() -> Result<()> {
    let registry = DynamicPortRegistry::new();

    registry.set(2, 10, 33001)?;

    assert_eq!(registry.get(10, 2), Some(33001), "expected reversed pair lookup to find the entry");
    assert_eq!(registry.get(2, 10), Some(33001), "expected ordered pair lookup to find the entry");
    Ok(())
}

#[test]
fn self_pair_is_rejected() -> Result<()> {
    let registry = DynamicPortRegistry::new();

    let res = registry.set(3, 3, 33001);

    assert!(res.is_err(), "expected a self pair registration to be rejected");
    Ok(())
}

#[test]
fn overlay_substitutes_registered_dynamic_ports() -> Result<()> {
    let doc = fixtures::cluster_doc(&[1, 2], 5);
    let registry = DynamicPortRegistry::new();
    registry.set(1, fixtures::DATA_NODE, 33001)?;

    let served = registry.overlay(&doc);

    let overlaid = served.sections.iter().find_map(|section| match section {
        Section::Connection(ConnectionSection { node_a: 1, node_b, port }) if *node_b == fixtures::DATA_NODE => Some(*port),
        _ => None,
    });
    assert_eq!(overlaid, Some(33001), "expected the registered dynamic port to be substituted, got {:?}", overlaid);

    // Unregistered dynamic pairs keep the sentinel.
    let unregistered = served.sections.iter().find_map(|section| match section {
        Section::Connection(ConnectionSection { node_a: 2, node_b, port }) if *node_b == fixtures::DATA_NODE => Some(*port),
        _ => None,
    });
    assert_eq!(unregistered, Some(-1), "expected unregistered dynamic pairs to keep the sentinel, got {:?}", unregistered);
    Ok(())
}

#[test]
fn overlay_never_mutates_the_stored_document() -> Result<()> {
    let doc = fixtures::cluster_doc(&[1, 2], 5);
    let checksum = doc.checksum();
    let registry = DynamicPortRegistry::new();
    registry.set(1, fixtures::DATA_NODE, 33001)?;

    let _served = registry.overlay(&doc);

    assert_eq!(doc.checksum(), checksum, "expected the stored document to be unchanged by overlay");
    let sentinel = doc.sections.iter().find_map(|section| match section {
        Section::Connection(ConnectionSection { node_a: 1, node_b, port }) if *node_b == fixtures::DATA_NODE => Some(*port),
        _ => None,
    });
    assert_eq!(sentinel, Some(-1), "expected the stored document to keep the dynamic sentinel, got {:?}", sentinel);
    Ok(())
}
