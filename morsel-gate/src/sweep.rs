//! Retention Sweep Background Task
//!
//! Expired rate windows and tile entries are never consulted again but stay
//! in the shared store until something deletes them. This task deletes
//! them on a fixed interval.
//!
//! - Rate windows are removed once they started before the longest
//!   configured window, so no live decision can depend on them.
//! - Tile entries are removed once past their expiry.
//!
//! Several processes may run a sweeper against the same store; purges are
//! idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use morsel_storage::{RateWindowStore, TileStore};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::rate_limiter::RateLimiter;
use crate::tile_index::TileIndex;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for sweep activity.
#[derive(Debug, Default)]
pub struct SweepMetrics {
    /// Rate windows deleted since startup
    pub windows_purged: AtomicU64,

    /// Tile entries deleted since startup
    pub tiles_purged: AtomicU64,

    /// Sweep cycles completed
    pub sweep_cycles: AtomicU64,

    /// Purge failures
    pub sweep_errors: AtomicU64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SweepSnapshot {
        SweepSnapshot {
            windows_purged: self.windows_purged.load(Ordering::Relaxed),
            tiles_purged: self.tiles_purged.load(Ordering::Relaxed),
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

/// Sweep counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSnapshot {
    pub windows_purged: u64,
    pub tiles_purged: u64,
    pub sweep_cycles: u64,
    pub sweep_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run one sweep cycle. Failures are logged and counted; a failed purge of
/// one kind does not skip the other.
pub async fn sweep_once<S>(
    limiter: &RateLimiter<S>,
    tiles: &TileIndex<S>,
    metrics: &SweepMetrics,
) where
    S: RateWindowStore + TileStore,
{
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);

    let windows = match limiter.purge_expired().await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(error = %e, "Failed to purge rate windows");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            0
        }
    };
    metrics.windows_purged.fetch_add(windows, Ordering::Relaxed);

    let expired_tiles = match tiles.purge_expired().await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(error = %e, "Failed to purge tile entries");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            0
        }
    };
    metrics.tiles_purged.fetch_add(expired_tiles, Ordering::Relaxed);

    if windows > 0 || expired_tiles > 0 {
        tracing::info!(
            windows,
            tiles = expired_tiles,
            "Retention sweep completed"
        );
    } else {
        tracing::trace!("Retention sweep completed with nothing to purge");
    }
}

/// Sweep every `every` until `shutdown_rx` turns `true`.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(sweep_task(limiter, tiles, config.sweep_interval, shutdown_rx));
///
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn sweep_task<S>(
    limiter: Arc<RateLimiter<S>>,
    tiles: Arc<TileIndex<S>>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweepMetrics>
where
    S: RateWindowStore + TileStore,
{
    let metrics = Arc::new(SweepMetrics::new());

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_secs = every.as_secs(), "Retention sweep task started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender also ends the task.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Retention sweep task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                sweep_once(&limiter, &tiles, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        windows_purged = snapshot.windows_purged,
        tiles_purged = snapshot.tiles_purged,
        sweep_cycles = snapshot.sweep_cycles,
        sweep_errors = snapshot.sweep_errors,
        "Retention sweep task completed"
    );

    metrics
}
