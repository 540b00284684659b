//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::{AppState, Gateways};
use crate::errors::EngineError;
use crate::workers::sweeper::{self, Sweep};
use crate::workers::scheduler;

/// Run the engine until `shutdown_signal` resolves
pub async fn run(
    version: String,
    options: AppOptions,
    gateways: Gateways,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), EngineError> {
    info!("Initializing kubedeck {}...", version);

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, gateways, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start engine: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    gateways: Gateways,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), EngineError> {
    let app_state = Arc::new(AppState::init(options, gateways).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    let pool_sweeper = init_sweeper(
        sweeper::Options {
            interval: options.pool.sweep_interval,
        },
        app_state.pool.clone(),
        shutdown_tx.subscribe(),
    );
    shutdown_manager.with_pool_sweeper_handle(pool_sweeper)?;

    let session_sweeper = init_sweeper(
        sweeper::Options {
            interval: options.sessions.sweep_interval,
        },
        app_state.sessions.clone(),
        shutdown_tx.subscribe(),
    );
    shutdown_manager.with_session_sweeper_handle(session_sweeper)?;

    if options.enable_refresh {
        app_state.refresh_pool.start()?;
        let handle = init_scheduler(options.scheduler.clone(), app_state.clone(), shutdown_tx.subscribe());
        shutdown_manager.with_scheduler_handle(handle)?;
    }

    Ok(())
}

fn init_sweeper<T>(
    options: sweeper::Options,
    target: Arc<T>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    T: Sweep + 'static,
{
    info!("Initializing {} sweeper...", target.name());
    tokio::spawn(async move {
        sweeper::run(
            &options,
            target.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    })
}

fn init_scheduler(
    options: scheduler::Options,
    app_state: Arc<AppState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    info!("Initializing refresh scheduler...");
    tokio::spawn(async move {
        scheduler::run(
            &options,
            app_state.catalog.as_ref(),
            app_state.refresh_pool.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    })
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    scheduler_handle: Option<JoinHandle<()>>,
    pool_sweeper_handle: Option<JoinHandle<()>>,
    session_sweeper_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            scheduler_handle: None,
            pool_sweeper_handle: None,
            session_sweeper_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), EngineError> {
        if self.app_state.is_some() {
            return Err(EngineError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_scheduler_handle(&mut self, handle: JoinHandle<()>) -> Result<(), EngineError> {
        if self.scheduler_handle.is_some() {
            return Err(EngineError::ShutdownError("scheduler_handle already set".to_string()));
        }
        self.scheduler_handle = Some(handle);
        Ok(())
    }

    pub fn with_pool_sweeper_handle(&mut self, handle: JoinHandle<()>) -> Result<(), EngineError> {
        if self.pool_sweeper_handle.is_some() {
            return Err(EngineError::ShutdownError("pool_sweeper_handle already set".to_string()));
        }
        self.pool_sweeper_handle = Some(handle);
        Ok(())
    }

    pub fn with_session_sweeper_handle(&mut self, handle: JoinHandle<()>) -> Result<(), EngineError> {
        if self.session_sweeper_handle.is_some() {
            return Err(EngineError::ShutdownError(
                "session_sweeper_handle already set".to_string(),
            ));
        }
        self.session_sweeper_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), EngineError> {
        info!("Shutting down kubedeck...");

        // 1. Refresh scheduler
        if let Some(handle) = self.scheduler_handle.take() {
            handle.await.map_err(|e| EngineError::ShutdownError(e.to_string()))?;
        }

        // 2. Sweepers
        if let Some(handle) = self.session_sweeper_handle.take() {
            handle.await.map_err(|e| EngineError::ShutdownError(e.to_string()))?;
        }
        if let Some(handle) = self.pool_sweeper_handle.take() {
            handle.await.map_err(|e| EngineError::ShutdownError(e.to_string()))?;
        }

        // 3. App state: deployments, refresh pool, pooled connections
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
