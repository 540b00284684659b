//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::orchestrator::DeployOptions;
use crate::ssh::pool::PoolOptions;
use crate::ssh::session::SessionOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::{refresh, scheduler};

/// Main application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    pub lifecycle: LifecycleOptions,

    pub storage: StorageOptions,

    pub pool: PoolOptions,

    pub sessions: SessionOptions,

    /// Run the refresh pool and its scheduler
    pub enable_refresh: bool,

    pub refresh: refresh::Options,

    pub scheduler: scheduler::Options,

    pub versions: VersionOptions,

    pub deploy: DeployOptions,
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    pub layout: StorageLayout,

    /// Catalog file overriding the layout's default location
    pub catalog_file: Option<PathBuf>,
}

/// Version cache and upstream source options
#[derive(Debug, Clone)]
pub struct VersionOptions {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub github_api_base: String,
    pub request_timeout: Duration,
}

impl Default for VersionOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(12 * 60 * 60),
            cache_capacity: 500,
            github_api_base: "https://api.github.com".to_string(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        let layout = settings
            .storage_dir
            .as_ref()
            .map(StorageLayout::new)
            .unwrap_or_default();
        let refresh = &settings.refresh;

        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(settings.max_shutdown_delay_secs),
            },
            storage: StorageOptions {
                layout,
                catalog_file: settings.catalog_file.as_ref().map(PathBuf::from),
            },
            pool: PoolOptions {
                connect_timeout: Duration::from_secs(settings.pool.connect_timeout_secs),
                idle_timeout: Duration::from_secs(settings.pool.idle_timeout_secs),
                sweep_interval: interval_secs(settings.pool.sweep_interval_secs),
            },
            sessions: SessionOptions {
                max_age: Duration::from_secs(settings.sessions.max_age_secs),
                max_idle: Duration::from_secs(settings.sessions.max_idle_secs),
                sweep_interval: interval_secs(settings.sessions.sweep_interval_secs),
            },
            enable_refresh: refresh.enabled,
            refresh: refresh::Options {
                workers: refresh.workers,
                queue_size: refresh.queue_size,
                refresh_interval: interval_secs(refresh.interval_secs),
                retry_attempts: refresh.retry_attempts,
                retry_delay: Duration::from_secs(refresh.retry_delay_secs),
            },
            scheduler: scheduler::Options {
                interval: interval_secs(refresh.interval_secs),
                ..Default::default()
            },
            versions: VersionOptions {
                cache_ttl: Duration::from_secs(refresh.cache_ttl_secs),
                cache_capacity: refresh.cache_capacity,
                github_api_base: refresh.github_api_base.clone(),
                request_timeout: Duration::from_secs(refresh.request_timeout_secs),
            },
            deploy: DeployOptions {
                install_timeout: Duration::from_secs(settings.deploy.install_timeout_secs),
                kubeconfig: settings.deploy.kubeconfig.clone(),
                scratch_dir: settings.deploy.scratch_dir.clone(),
                tls_dir: settings.deploy.tls_dir.clone(),
                tls_secret_namespace: settings.deploy.tls_secret_namespace.clone(),
                ingress_restart_command: settings.deploy.ingress_restart_command.clone(),
            },
        }
    }
}

/// Loop period of at least one second, so a zero setting cannot spin a worker
fn interval_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}
