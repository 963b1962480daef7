use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::coordinator::{CoordinatorCtl, CoordinatorHandle};
use crate::model::ConfigDocument;
use crate::network::PeerPool;
use crate::ports::DynamicPortRegistry;
use crate::storage::StagingStore;

/// The application object for when mgmtd is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The handle used for local administrative access to the coordinator.
    _coordinator: CoordinatorHandle,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the change coordinator.
    coordinator_handle: JoinHandle<Result<()>>,
    /// The join handle of the peer pool.
    pool_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Open this node's storage. Residue of an interrupted change refuses startup here.
        let store = StagingStore::open(&config).await.context("error opening configuration storage")?;
        let recovered = store.recover_latest().await.context("error recovering committed configuration")?;
        let initial = match (&recovered, &config.config_file) {
            (Some(recovered), _) => {
                tracing::info!(generation = recovered.generation, "recovered committed configuration from disk");
                None
            }
            (None, Some(path)) => Some(ConfigDocument::from_file(path).await?),
            (None, None) => None,
        };

        let (shutdown_tx, _) = broadcast::channel(100);
        let (requests_tx, requests_rx) = mpsc::channel(1000);
        let (peer_addrs_tx, peer_addrs_rx) = watch::channel(Arc::new(HashMap::new()));
        let ports = DynamicPortRegistry::new();

        let pool = PeerPool::new(config.clone(), peer_addrs_rx, requests_tx.clone(), shutdown_tx.clone());
        let (coordinator, coordinator_hd) = CoordinatorCtl::new(
            config.clone(),
            store,
            recovered,
            initial,
            Arc::new(pool.clone()),
            ports,
            peer_addrs_tx,
            shutdown_tx.clone(),
            requests_tx,
            requests_rx,
        );
        let coordinator_handle = coordinator.spawn();
        let pool_handle = pool.spawn();

        Ok(Self {
            _config: config,
            _coordinator: coordinator_hd,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            coordinator_handle,
            pool_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("mgmtd is shutting down");
        let mut fatal = None;
        if let Err(err) = self.coordinator_handle.await.context("error joining change coordinator handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down change coordinator");
            fatal = Some(err);
        }
        if let Err(err) = self.pool_handle.await.context("error joining peer pool handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down peer pool");
        }

        tracing::debug!("mgmtd shutdown complete");
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
