//! kubedeck - Entry Point
//!
//! Runs the deployment engine's background services: connection and session
//! sweepers and the version refresh pool.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use kubedeck::app::options::AppOptions;
use kubedeck::app::run::run;
use kubedeck::app::state::Gateways;
use kubedeck::filesys::file::File;
use kubedeck::gateways::catalog::StaticCatalog;
use kubedeck::gateways::UnconfiguredGateway;
use kubedeck::kv::{keys, FileKvStore, KvStore};
use kubedeck::logs::{init_logging, LogOptions};
use kubedeck::storage::layout::StorageLayout;
use kubedeck::storage::settings::Settings;
use kubedeck::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => StorageLayout::default().settings_file(),
    };
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file {:?}: {}", settings_file.path(), e);
                return;
            }
        }
    } else {
        Settings::default()
    };
    let options = AppOptions::from(&settings);

    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        run_diagnostic(&settings_file, &options).await;
        return;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| options.storage.layout.logs_dir()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let gateways = Gateways {
        dns: Arc::new(UnconfiguredGateway),
        issuer: Arc::new(UnconfiguredGateway),
    };

    info!("Running kubedeck with options: {:?}", options);
    let result = run(version.version, options, gateways, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run kubedeck: {e}");
    }
}

async fn run_diagnostic(settings_file: &File, options: &AppOptions) {
    let layout = &options.storage.layout;
    println!("kubedeck diagnostic");
    println!("  settings file:  {:?} (exists: {})", settings_file.path(), settings_file.exists().await);
    println!("  storage dir:    {:?}", layout.base_dir);

    let catalog_file = match &options.storage.catalog_file {
        Some(path) => File::new(path),
        None => layout.catalog_file(),
    };
    match StaticCatalog::load(&catalog_file).await {
        Ok(_) => println!("  catalog:        OK ({:?})", catalog_file.path()),
        Err(e) => println!("  catalog:        FAILED ({:?}: {})", catalog_file.path(), e),
    }

    match FileKvStore::open(layout.kv_file()).await {
        Ok(kv) => {
            let apps = kv.list_keys(keys::APP_PREFIX).await.map(|keys| {
                keys.iter()
                    .filter(|k| keys::app_id_from_key(k).is_some())
                    .count()
            });
            let ssh_key = kv.get(keys::SSH_PRIVATE_KEY).await.map(|v| v.is_some());
            println!("  kv store:       OK ({:?})", layout.kv_file().path());
            println!("  applications:   {}", apps.unwrap_or(0));
            println!("  ssh key:        {}", if ssh_key.unwrap_or(false) { "configured" } else { "MISSING" });
        }
        Err(e) => println!("  kv store:       FAILED ({})", e),
    }
    println!("  known hosts:    {:?}", layout.known_hosts_file().path());
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGINT handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
