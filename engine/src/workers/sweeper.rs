//! Periodic eviction worker for the connection pool and session table

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

/// Something that can evict stale entries
#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evict stale entries, returning how many were removed
    async fn sweep(&self) -> usize;
}

/// Sweeper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between sweeps
    pub interval: Duration,
}

/// Run the sweeper worker
pub async fn run<T, S, F>(
    options: &Options,
    target: &T,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    T: Sweep + ?Sized,
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Sweeper for {} starting (every {:?})...", target.name(), options.interval);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Sweeper for {} shutting down...", target.name());
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let removed = target.sweep().await;
        if removed > 0 {
            info!("Sweeper for {} evicted {} entries", target.name(), removed);
        } else {
            debug!("Sweeper for {} found nothing to evict", target.name());
        }
    }
}
