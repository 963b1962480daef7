use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::{ChangeState, CoordinatorCtl, Requester};
use crate::config::Config;
use crate::error::ConfigError;
use crate::fixtures;
use crate::model::{ConfigDocument, ProtocolState, Section};
use crate::network::memory::RecordingNetwork;
use crate::network::PeerMessage;
use crate::ports::DynamicPortRegistry;
use crate::storage::StagingStore;
use crate::NodeId;

struct Harness {
    ctl: CoordinatorCtl,
    net: Arc<RecordingNetwork>,
    _tmpdir: tempfile::TempDir,
    _addrs_rx: watch::Receiver<Arc<HashMap<NodeId, String>>>,
}

/// Build a coordinator for direct handler driving, without spawning its run loop.
async fn harness(node_id: NodeId, recovered: Option<ConfigDocument>, initial: Option<ConfigDocument>) -> Result<Harness> {
    let (config, tmpdir) = Config::new_test(node_id)?;
    let store = StagingStore::open(&config).await?;
    let net = RecordingNetwork::new();
    let (addrs_tx, addrs_rx) = watch::channel(Arc::new(HashMap::new()));
    let (shutdown_tx, _) = broadcast::channel(16);
    let (requests_tx, requests_rx) = mpsc::channel(64);
    let (ctl, _handle) = CoordinatorCtl::new(
        config,
        store,
        recovered,
        initial,
        net.clone(),
        DynamicPortRegistry::new(),
        addrs_tx,
        shutdown_tx,
        requests_tx,
        requests_rx,
    );
    Ok(Harness { ctl, net, _tmpdir: tmpdir, _addrs_rx: addrs_rx })
}

/// Pull the rejection code out of the last recorded send, if it was a rejection.
fn last_prepare_ref(net: &RecordingNetwork) -> Option<ConfigError> {
    net.drain().pop().and_then(|(_, msg)| match msg {
        PeerMessage::PrepareRef { error } => Some(error),
        _ => None,
    })
}

#[tokio::test]
async fn prepare_stages_then_commit_applies() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;
    let candidate = fixtures::diverged_cluster_doc(&[1, 2], 6);

    h.ctl.handle_prepare(1, candidate.clone(), false).await;

    assert!(matches!(h.net.drain().as_slice(), [(1, PeerMessage::PrepareConf)]), "expected a prepare confirmation to node 1");
    assert!(h.ctl.staged.is_some(), "expected the candidate to be staged");
    assert_eq!(h.ctl.state, ProtocolState::Confirmed, "expected the protocol state to be unchanged by prepare");
    let current_gen = h.ctl.current.as_ref().map(|doc| doc.generation);
    assert_eq!(current_gen, Some(5), "expected the active document to be unchanged by prepare, got {:?}", current_gen);

    h.ctl.handle_commit(1).await;

    assert!(matches!(h.net.drain().as_slice(), [(1, PeerMessage::CommitConf)]), "expected a commit confirmation to node 1");
    assert!(h.ctl.staged.is_none(), "expected the staged change to be consumed by commit");
    let current = h.ctl.current.clone().expect("expected an active document after commit");
    assert_eq!(current.generation, 6, "expected generation 6 after commit, got {}", current.generation);
    assert_eq!(*current, candidate, "expected the staged candidate to be the active document");

    let recovered = h.ctl.store.recover_latest().await?.expect("expected the committed document on disk");
    assert_eq!(recovered.generation, 6, "expected generation 6 on disk, got {}", recovered.generation);
    Ok(())
}

#[tokio::test]
async fn prepare_rejects_wrong_generation() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;

    h.ctl.handle_prepare(1, fixtures::cluster_doc(&[1, 2], 7), false).await;

    assert_eq!(last_prepare_ref(&h.net), Some(ConfigError::InvalidGeneration), "expected a generation skip to be rejected");
    assert!(h.ctl.staged.is_none(), "expected nothing to be staged");
    Ok(())
}

#[tokio::test]
async fn prepare_rejects_changed_cluster_name() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;
    let mut candidate = fixtures::cluster_doc(&[1, 2], 6);
    candidate.cluster_name = "othercluster".into();

    h.ctl.handle_prepare(1, candidate, false).await;

    assert_eq!(last_prepare_ref(&h.net), Some(ConfigError::InvalidConfigName), "expected a renamed cluster to be rejected");
    Ok(())
}

#[tokio::test]
async fn prepare_rejects_changed_primary() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;
    let mut candidate = fixtures::cluster_doc(&[1, 2], 6);
    candidate.primary_node_id = 2;

    h.ctl.handle_prepare(1, candidate, false).await;

    assert_eq!(
        last_prepare_ref(&h.net),
        Some(ConfigError::NotPrimaryManagementNode),
        "expected a changed primary management node to be rejected"
    );
    Ok(())
}

#[tokio::test]
async fn prepare_rejects_incompatible_candidate() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;
    let mut candidate = fixtures::cluster_doc(&[1, 2], 6);
    candidate.sections.retain(|section| !matches!(section, Section::Node(node) if node.node_id == fixtures::DATA_NODE));
    candidate.sections.retain(|section| !matches!(section, Section::Connection(_)));

    h.ctl.handle_prepare(1, candidate, false).await;

    assert_eq!(
        last_prepare_ref(&h.net),
        Some(ConfigError::IllegalConfigChange),
        "expected removal of a node section to be rejected"
    );
    Ok(())
}

#[tokio::test]
async fn prepare_rejects_initial_flag_when_confirmed() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;

    h.ctl.handle_prepare(1, fixtures::cluster_doc(&[1, 2], 1), true).await;

    assert_eq!(
        last_prepare_ref(&h.net),
        Some(ConfigError::IllegalInitialState),
        "expected an initial prepare against a confirmed node to be rejected"
    );
    Ok(())
}

#[tokio::test]
async fn prepare_rejects_initial_generation_other_than_one() -> Result<()> {
    let mut h = harness(2, None, Some(fixtures::cluster_doc(&[1, 2], 0))).await?;

    h.ctl.handle_prepare(1, fixtures::cluster_doc(&[1, 2], 2), true).await;

    assert_eq!(
        last_prepare_ref(&h.net),
        Some(ConfigError::IllegalInitialGeneration),
        "expected an initial prepare beyond generation 1 to be rejected"
    );
    Ok(())
}

#[tokio::test]
async fn prepare_rejects_different_initial_document() -> Result<()> {
    let mut h = harness(2, None, Some(fixtures::cluster_doc(&[1, 2], 0))).await?;
    let candidate = fixtures::diverged_cluster_doc(&[1, 2], 1);

    h.ctl.handle_prepare(1, candidate, true).await;

    assert_eq!(
        last_prepare_ref(&h.net),
        Some(ConfigError::DifferentInitial),
        "expected a diverged initial document to be rejected"
    );
    assert_eq!(h.ctl.state, ProtocolState::Initial, "expected the node to remain in the initial state");
    Ok(())
}

#[tokio::test]
async fn prepare_rejects_concurrent_change() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;
    h.ctl.handle_prepare(1, fixtures::diverged_cluster_doc(&[1, 2], 6), false).await;
    let _ = h.net.drain();

    h.ctl.handle_prepare(1, fixtures::cluster_doc(&[1, 2], 6), false).await;

    assert_eq!(
        last_prepare_ref(&h.net),
        Some(ConfigError::ChangeAlreadyInProgress),
        "expected a second prepare to be rejected while one is staged"
    );
    Ok(())
}

#[tokio::test]
async fn abort_discards_staged_change_idempotently() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;
    h.ctl.handle_prepare(1, fixtures::diverged_cluster_doc(&[1, 2], 6), false).await;
    let _ = h.net.drain();

    h.ctl.handle_abort(1).await;
    h.ctl.handle_abort(1).await;

    let replies = h.net.drain();
    assert!(
        matches!(replies.as_slice(), [(1, PeerMessage::AbortConf), (1, PeerMessage::AbortConf)]),
        "expected both aborts to be acknowledged, got {:?}",
        replies
    );
    assert!(h.ctl.staged.is_none(), "expected the staged change to be discarded");
    let current_gen = h.ctl.current.as_ref().map(|doc| doc.generation);
    assert_eq!(current_gen, Some(5), "expected the active document to be unaffected by abort, got {:?}", current_gen);

    // No residue remains, so the same generation can be staged again.
    h.ctl.handle_prepare(1, fixtures::diverged_cluster_doc(&[1, 2], 6), false).await;
    assert!(matches!(h.net.drain().as_slice(), [(1, PeerMessage::PrepareConf)]), "expected re-staging after abort to succeed");
    Ok(())
}

#[tokio::test]
async fn commit_without_staged_change_is_fatal() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;

    h.ctl.handle_commit(1).await;

    assert!(h.ctl.fatal_err.is_some(), "expected a commit without a staged change to be fatal");
    Ok(())
}

#[tokio::test]
async fn change_request_rejected_when_not_master() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;
    h.ctl.connected.insert(1);
    h.ctl.checked.insert(1);
    let (tx, rx) = oneshot::channel();

    h.ctl.handle_change_request(fixtures::cluster_doc(&[1, 2], 0), Requester::Local(tx)).await;

    let res = rx.await?;
    assert_eq!(res, Err(ConfigError::NotMaster), "expected a non initiator to reject the change, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn change_request_rejected_when_not_all_started() -> Result<()> {
    let mut h = harness(1, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;
    let (tx, rx) = oneshot::channel();

    h.ctl.handle_change_request(fixtures::cluster_doc(&[1, 2], 0), Requester::Local(tx)).await;

    let res = rx.await?;
    assert_eq!(res, Err(ConfigError::NotAllStarted), "expected a change without all peers ready to be rejected, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn change_request_rejected_when_uninitialized() -> Result<()> {
    let mut h = harness(1, None, None).await?;
    let (tx, rx) = oneshot::channel();

    h.ctl.handle_change_request(fixtures::cluster_doc(&[1, 2], 0), Requester::Local(tx)).await;

    let res = rx.await?;
    assert_eq!(res, Err(ConfigError::NoConfigData), "expected a change without configuration data to be rejected, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn change_request_rejected_while_change_in_progress() -> Result<()> {
    let mut h = harness(2, Some(fixtures::cluster_doc(&[1, 2], 5)), None).await?;
    h.ctl.handle_prepare(1, fixtures::diverged_cluster_doc(&[1, 2], 6), false).await;
    let _ = h.net.drain();
    let (tx, rx) = oneshot::channel();

    h.ctl.handle_change_request(fixtures::cluster_doc(&[1, 2], 0), Requester::Local(tx)).await;

    let res = rx.await?;
    assert_eq!(res, Err(ConfigError::ChangeAlreadyInProgress), "expected a busy node to reject a new change, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn change_request_assigns_successor_generation() -> Result<()> {
    let mut h = harness(1, Some(fixtures::cluster_doc(&[1], 5)), None).await?;
    let (tx, _rx) = oneshot::channel();

    h.ctl.handle_change_request(fixtures::cluster_doc(&[1], 0), Requester::Local(tx)).await;

    match &h.ctl.change {
        ChangeState::Preparing { ctx, awaiting } => {
            assert_eq!(*awaiting, 1, "expected the first prepare to target the local node, got {}", awaiting);
            assert_eq!(ctx.document.generation, 6, "expected the coordinator to assign generation 6, got {}", ctx.document.generation);
        }
        _ => panic!("expected the change to be preparing"),
    }
    Ok(())
}
