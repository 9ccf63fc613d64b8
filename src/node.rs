//! Node startup: wires the transport, the role's orchestrator and the spool
//! monitor together and runs until shutdown.

use crate::config::{RelayConfig, Role};
use crate::fetch::{CommandFetcher, Fetcher};
use crate::relay::{FarRelay, NearRelay};
use crate::spool::SpoolMonitor;
use crate::transport::{BundleTransport, Transport, TransportSession};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;

/// Run one relay node with the external bundle agent and fetch utility.
pub async fn run<S>(config: RelayConfig, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    let transport: Arc<dyn Transport> = Arc::new(BundleTransport::new(
        &config.spool_dir,
        &config.transport,
        config.endpoints(),
    ));
    let fetcher: Arc<dyn Fetcher> = Arc::new(CommandFetcher::new(&config.fetch));
    run_with(config, transport, fetcher, shutdown).await
}

/// Run one relay node over the given transport and fetcher.
pub async fn run_with<S>(
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    fetcher: Arc<dyn Fetcher>,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    tokio::fs::create_dir_all(&config.spool_dir)
        .await
        .with_context(|| format!("Failed to create spool {}", config.spool_dir.display()))?;

    let session = TransportSession::new(transport);
    let monitor = Arc::new(SpoolMonitor::new(&config.spool_dir, &config.dedupe));

    tracing::info!(
        role = config.role.as_str(),
        spool = %config.spool_dir.display(),
        "starting relay node"
    );

    // A missing agent is logged, not fatal: deliveries can still be
    // processed and the next send retries the listener
    if let Err(e) = session.start_listening().await {
        tracing::warn!(error = %e, "failed to start listener");
    }

    let result = match config.role {
        Role::Far => {
            let relay = Arc::new(FarRelay::new(&config, fetcher, session.clone()));
            monitor.run(relay, shutdown).await
        }
        Role::Near => {
            tokio::fs::create_dir_all(config.cache_dir())
                .await
                .with_context(|| {
                    format!("Failed to create cache {}", config.cache_dir().display())
                })?;
            let relay = Arc::new(NearRelay::new(&config, session.clone()));
            monitor.run(relay, shutdown).await
        }
    };

    session.cancel().await;
    tracing::info!(role = config.role.as_str(), "relay node stopped");
    result
}
