//! Retention sweeper.
//!
//! Opens the shared store and deletes expired rate windows and tile entries
//! until interrupted.

use std::sync::Arc;

use morsel_core::{Clock, GateConfig, SystemClock};
use morsel_gate::{init_tracing, sweep_task, RateLimiter, TileIndex};
use morsel_storage::LmdbStore;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let config = GateConfig::from_env()?;
    let store = Arc::new(LmdbStore::open(&config.lmdb_path, config.lmdb_map_size_mb)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let limiter = Arc::new(RateLimiter::new(
        Arc::clone(&store),
        Arc::new(config.rate_limits.clone()),
        Arc::clone(&clock),
    ));
    let tiles = Arc::new(TileIndex::new(store, clock, config.tile_ttl));

    tracing::info!(
        lmdb_path = %config.lmdb_path.display(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "Starting morsel sweeper"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(sweep_task(limiter, tiles, config.sweep_interval, shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let metrics = handle.await?;
    let snapshot = metrics.snapshot();
    tracing::info!(
        windows_purged = snapshot.windows_purged,
        tiles_purged = snapshot.tiles_purged,
        "Sweeper stopped"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
