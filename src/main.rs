//! The cluster management configuration daemon.

mod app;
mod config;
mod coordinator;
mod error;
#[cfg(test)]
mod fixtures;
mod fragment;
mod model;
mod network;
mod ports;
#[cfg(test)]
mod ports_test;
mod storage;
#[cfg(test)]
mod storage_test;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

/// The ID of a node within the cluster.
pub type NodeId = u64;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        node_id = %cfg.node_id,
        server_port = %cfg.server_port,
        storage_data_path = %cfg.storage_data_path,
        "starting cluster management configuration daemon",
    );
    let exit_err = App::new(cfg).await?.spawn().await.context("error joining app handle").and_then(|res| res).err();
    if let Some(err) = &exit_err {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    if exit_err.is_some() {
        // A fatal protocol or persistence condition was hit. Cluster level redundancy is
        // responsible for availability from this point, so go down hard.
        std::process::exit(1);
    }
    Ok(())
}
