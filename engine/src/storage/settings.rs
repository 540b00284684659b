//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rotated log files under the storage directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Storage base directory, defaults to `/var/lib/kubedeck`
    #[serde(default)]
    pub storage_dir: Option<String>,

    /// Catalog file, defaults to `catalog.json` in the storage directory
    #[serde(default)]
    pub catalog_file: Option<String>,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub sessions: SessionSettings,

    #[serde(default)]
    pub refresh: RefreshSettings,

    #[serde(default)]
    pub deploy: DeploySettings,

    /// Maximum delay for graceful shutdown
    #[serde(default = "default_shutdown_delay")]
    pub max_shutdown_delay_secs: u64,
}

fn default_shutdown_delay() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            storage_dir: None,
            catalog_file: None,
            pool: PoolSettings::default(),
            sessions: SessionSettings::default(),
            refresh: RefreshSettings::default(),
            deploy: DeploySettings::default(),
            max_shutdown_delay_secs: default_shutdown_delay(),
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            idle_timeout_secs: 600,
            sweep_interval_secs: 300,
        }
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_age_secs: u64,
    pub max_idle_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_age_secs: 30 * 60,
            max_idle_secs: 15 * 60,
            sweep_interval_secs: 120,
        }
    }
}

/// Version refresh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub enabled: bool,
    pub workers: usize,
    pub queue_size: usize,
    pub interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,

    /// How long a refreshed version stays fresh in the cache
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,

    pub github_api_base: String,
    pub request_timeout_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 4,
            queue_size: 100,
            interval_secs: 6 * 60 * 60,
            retry_attempts: 2,
            retry_delay_secs: 5,
            cache_ttl_secs: 12 * 60 * 60,
            cache_capacity: 500,
            github_api_base: "https://api.github.com".to_string(),
            request_timeout_secs: 15,
        }
    }
}

/// Deployment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    pub install_timeout_secs: u64,
    pub kubeconfig: String,
    pub scratch_dir: String,
    pub tls_dir: String,
    pub tls_secret_namespace: String,
    pub ingress_restart_command: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            install_timeout_secs: 600,
            kubeconfig: "/etc/rancher/k3s/k3s.yaml".to_string(),
            scratch_dir: "/tmp/kubedeck".to_string(),
            tls_dir: "/etc/kubedeck/tls".to_string(),
            tls_secret_namespace: "kube-system".to_string(),
            ingress_restart_command: "kubectl -n kube-system rollout restart deployment traefik".to_string(),
        }
    }
}
