//! Periodic catalog-wide version refresh

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::gateways::catalog::Catalog;
use crate::workers::refresh::{Priority, RefreshPool};

/// Scheduler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between catalog sweeps
    pub interval: Duration,

    /// Delay before the first sweep
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 60 * 60),
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Queue one low-priority refresh per catalog entry
pub async fn enqueue_catalog(catalog: &dyn Catalog, pool: &RefreshPool) -> usize {
    let entries = match catalog.list().await {
        Ok(entries) => entries,
        Err(e) => {
            error!("Failed to list catalog for refresh: {}", e);
            return 0;
        }
    };

    for entry in &entries {
        pool.queue_request(&entry.id, Priority::Low, |app_id, result| {
            if let Err(e) = result {
                debug!("Scheduled refresh of {} did not complete: {}", app_id, e);
            }
        });
    }
    entries.len()
}

/// Run the scheduler worker
pub async fn run<S, F>(
    options: &Options,
    catalog: &dyn Catalog,
    pool: &RefreshPool,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Refresh scheduler starting (every {:?})...", options.interval);

    let mut delay = options.initial_delay;
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Refresh scheduler shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }
        delay = options.interval;

        let queued = enqueue_catalog(catalog, pool).await;
        debug!("Queued {} scheduled refreshes", queued);
    }
}
