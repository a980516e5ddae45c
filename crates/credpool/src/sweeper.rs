//! Background idle sweeper.
//!
//! Runs [`HeterogeneousPool::sweep_idle`] on a fixed period until it is
//! stopped or the pool is closed. Acquisitions already sweep lazily; the
//! sweeper only matters for pools that sit unused while holding sessions.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::HeterogeneousPool;
use crate::session::SessionFactory;

/// Handle to a running sweeper task.
///
/// Dropping the handle stops the sweeper.
#[derive(Debug)]
pub struct IdleSweeper {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Shortest period the sweeper runs at; shorter requests are raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

impl IdleSweeper {
    pub fn spawn<F: SessionFactory>(pool: HeterogeneousPool<F>, interval: Duration) -> Self {
        let interval = if interval < MIN_SWEEP_INTERVAL {
            warn!(
                requested = ?interval,
                interval = ?MIN_SWEEP_INTERVAL,
                "sweep interval too short; using the minimum"
            );
            MIN_SWEEP_INTERVAL
        } else {
            interval
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweep_loop(pool, interval, shutdown_rx));
        info!(interval = ?interval, "idle sweeper started");
        Self {
            handle: Some(handle),
            shutdown_tx,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signal the sweeper to stop and wait for it to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("idle sweeper stopped");
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.shutdown_tx.send(true);
            handle.abort();
        }
    }
}

async fn run_sweep_loop<F: SessionFactory>(
    pool: HeterogeneousPool<F>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if pool.is_closed() {
                    debug!("pool closed; idle sweeper exiting");
                    break;
                }
                let reaped = pool.sweep_idle().await;
                debug!(reaped, "idle sweep finished");
            }
            _ = shutdown.changed() => {
                debug!("idle sweeper shutting down");
                break;
            }
        }
    }
}
