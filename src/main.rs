//! Kubernetes to Consul registrar and kubelet metrics relay.
//!
//! `MODE=registrar` (default) keeps Consul in sync with cluster nodes and
//! annotated pods. `MODE=proxy` serves the kubelet cAdvisor relay.

use log::{error, info};
use tokio::signal;
use tokio::sync::watch;

mod cluster;
mod config;
mod error;
mod reconciler;
mod registry;
mod relay;
mod shard;
mod types;

use cluster::KubeCluster;
use config::{Config, Mode};
use reconciler::Reconciler;
use registry::ConsulAgent;
use shard::ShardSelector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting in {:?} mode with config: {:?}", cfg.mode, cfg);

    // Clients are built up front so misconfiguration fails fast in either mode.
    let registry = ConsulAgent::new(cfg.consul_url())?;
    let cluster = KubeCluster::connect().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker = match cfg.mode {
        Mode::Registrar => {
            let shards = ShardSelector::from_entropy(cfg.shard_paths.clone());
            let reconciler = Reconciler::new(cluster, registry, &cfg, shards);
            tokio::spawn(async move {
                reconciler.run(shutdown_rx).await;
                Ok::<(), anyhow::Error>(())
            })
        }
        Mode::Proxy => {
            let relay_cfg = cfg.clone();
            tokio::spawn(async move { relay::serve(&relay_cfg, shutdown_rx).await })
        }
    };

    // Graceful Shutdown
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        res = &mut worker => {
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    match worker.await {
        Ok(Err(e)) => error!("{:?} worker failed during shutdown: {}", cfg.mode, e),
        Err(e) => error!("{:?} worker ended abnormally: {}", cfg.mode, e),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete.");
    Ok(())
}
