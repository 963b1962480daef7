use anyhow::Result;

use crate::config::Config;
use crate::fixtures;
use crate::storage::StagingStore;

#[tokio::test]
async fn stage_commit_round_trip() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(1)?;
    let mut store = StagingStore::open(&config).await?;
    let doc = fixtures::cluster_doc(&[1, 2], 1);

    store.stage(&doc).await?;
    store.commit().await?;

    let recovered = store.recover_latest().await?.expect("expected a committed document to be recovered");
    assert_eq!(recovered, doc, "expected the recovered document to match the staged one");
    Ok(())
}

#[tokio::test]
async fn stage_rejects_committed_residue() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(1)?;
    let mut store = StagingStore::open(&config).await?;
    let doc = fixtures::cluster_doc(&[1, 2], 1);
    store.stage(&doc).await?;
    store.commit().await?;

    let res = store.stage(&doc).await;

    assert!(res.is_err(), "expected staging over a committed generation to be rejected");
    Ok(())
}

#[tokio::test]
async fn abort_is_idempotent_and_preserves_committed_state() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(1)?;
    let mut store = StagingStore::open(&config).await?;
    let committed = fixtures::cluster_doc(&[1, 2], 1);
    store.stage(&committed).await?;
    store.commit().await?;

    let candidate = fixtures::cluster_doc(&[1, 2], 2);
    store.stage(&candidate).await?;
    store.abort().await?;
    store.abort().await?;

    // The aborted candidate leaves no residue, so staging the same generation works again.
    store.stage(&candidate).await?;
    store.abort().await?;

    let recovered = store.recover_latest().await?.expect("expected the committed document to survive aborts");
    assert_eq!(recovered, committed, "expected the previously committed document to be unaffected by aborts");
    Ok(())
}

#[tokio::test]
async fn startup_refuses_unresolved_staged_change() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(1)?;
    let mut store = StagingStore::open(&config).await?;
    let committed = fixtures::cluster_doc(&[1, 2], 6);
    store.stage(&committed).await?;
    store.commit().await?;
    let interrupted = fixtures::cluster_doc(&[1, 2], 7);
    store.stage(&interrupted).await?;
    drop(store);

    let res = StagingStore::open(&config).await;

    let err = match res {
        Ok(_) => panic!("expected startup to refuse the unresolved staged change"),
        Err(err) => err,
    };
    assert!(
        format!("{:?}", err).contains("unresolved configuration change"),
        "expected an unresolved change diagnostic, got {:?}",
        err
    );
    Ok(())
}

#[tokio::test]
async fn startup_ignores_other_nodes_residue() -> Result<()> {
    let (config, tmpdir) = Config::new_test(1)?;
    let other = Config {
        node_id: 2,
        ..(*config).clone()
    };
    let mut other_store = StagingStore::open(&other).await?;
    other_store.stage(&fixtures::cluster_doc(&[1, 2], 7)).await?;
    drop(other_store);

    let res = StagingStore::open(&config).await;

    assert!(res.is_ok(), "expected another node's residue in {} to be ignored", tmpdir.path().display());
    Ok(())
}

#[tokio::test]
async fn recover_latest_picks_highest_generation() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(1)?;
    let mut store = StagingStore::open(&config).await?;
    for generation in 1..=3 {
        store.stage(&fixtures::cluster_doc(&[1, 2], generation)).await?;
        store.commit().await?;
    }

    let recovered = store.recover_latest().await?.expect("expected a committed document to be recovered");

    assert_eq!(recovered.generation, 3, "expected the highest committed generation, got {}", recovered.generation);
    Ok(())
}

#[tokio::test]
async fn recover_latest_on_empty_store_is_none() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(1)?;
    let store = StagingStore::open(&config).await?;

    let recovered = store.recover_latest().await?;

    assert!(recovered.is_none(), "expected no document from an empty store, got {:?}", recovered);
    Ok(())
}

#[tokio::test]
async fn commit_without_stage_is_an_error() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(1)?;
    let mut store = StagingStore::open(&config).await?;

    let res = store.commit().await;

    assert!(res.is_err(), "expected commit without a staged change to be an error");
    Ok(())
}
