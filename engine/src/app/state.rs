//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::cache::version::VersionCache;
use crate::deploy::orchestrator::{Collaborators, Orchestrator};
use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::gateways::catalog::{Catalog, StaticCatalog};
use crate::gateways::{CertificateIssuer, DnsGateway};
use crate::kv::{FileKvStore, KvStore};
use crate::ssh::host_keys::HostKeyStore;
use crate::ssh::pool::ConnectionPool;
use crate::ssh::russh_dialer::RusshDialer;
use crate::ssh::session::SessionManager;
use crate::ssh::Dialer;
use crate::versions::{CachedVersionSource, CatalogVersionSource, GithubReleaseSource, VersionSource};
use crate::workers::refresh::RefreshPool;

/// DNS and certificate providers supplied by the embedding service
#[derive(Clone)]
pub struct Gateways {
    pub dns: Arc<dyn DnsGateway>,
    pub issuer: Arc<dyn CertificateIssuer>,
}

/// Main application state
pub struct AppState {
    pub kv: Arc<dyn KvStore>,

    pub catalog: Arc<dyn Catalog>,

    pub pool: Arc<ConnectionPool>,

    pub sessions: Arc<SessionManager>,

    pub version_cache: Arc<VersionCache>,

    pub refresh_pool: Arc<RefreshPool>,

    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Build the state from files in the storage layout, dialing over SSH
    pub async fn init(options: &AppOptions, gateways: Gateways) -> Result<Self, EngineError> {
        info!("Initializing application state...");
        let layout = &options.storage.layout;

        let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::open(layout.kv_file()).await?);
        let host_keys = Arc::new(HostKeyStore::open(layout.known_hosts_file()).await?);
        let dialer: Arc<dyn Dialer> = Arc::new(RusshDialer::new(host_keys));

        let catalog_file = match &options.storage.catalog_file {
            Some(path) => File::new(path),
            None => layout.catalog_file(),
        };

        Self::assemble(options, kv, dialer, &catalog_file, gateways).await
    }

    /// Wire the components around an existing store and dialer
    pub async fn assemble(
        options: &AppOptions,
        kv: Arc<dyn KvStore>,
        dialer: Arc<dyn Dialer>,
        catalog_file: &File,
        gateways: Gateways,
    ) -> Result<Self, EngineError> {
        let version_cache = Arc::new(VersionCache::new(
            options.versions.cache_ttl,
            options.versions.cache_capacity,
        ));

        let catalog = if catalog_file.exists().await {
            StaticCatalog::load(catalog_file).await?
        } else {
            warn!("Catalog file {:?} not found, starting with an empty catalog", catalog_file.path());
            StaticCatalog::new(Vec::new())
        };
        let catalog: Arc<dyn Catalog> = Arc::new(catalog);

        let pool = Arc::new(ConnectionPool::new(dialer, options.pool.clone()));
        let sessions = Arc::new(SessionManager::new(pool.clone(), options.sessions.clone()));

        let github: Arc<dyn VersionSource> = Arc::new(GithubReleaseSource::new(
            catalog.clone(),
            &options.versions.github_api_base,
            options.versions.request_timeout,
        )?);
        let source: Arc<dyn VersionSource> =
            Arc::new(CatalogVersionSource::new(catalog.clone()).with_upstream(github.clone()));
        let refresh_pool = Arc::new(RefreshPool::new(
            options.refresh.clone(),
            source,
            version_cache.clone(),
        ));

        // Creates read the cache first; a pinned fallback is never cached
        let cached: Arc<dyn VersionSource> = Arc::new(CachedVersionSource::new(version_cache.clone(), github));
        let versions: Arc<dyn VersionSource> =
            Arc::new(CatalogVersionSource::new(catalog.clone()).with_upstream(cached));

        let orchestrator = Arc::new(Orchestrator::new(
            Collaborators {
                kv: kv.clone(),
                catalog: catalog.clone(),
                dns: gateways.dns,
                issuer: gateways.issuer,
                sessions: sessions.clone(),
                versions,
            },
            options.deploy.clone(),
        ));

        Ok(Self {
            kv,
            catalog,
            pool,
            sessions,
            version_cache,
            refresh_pool,
            orchestrator,
        })
    }

    /// Drain in-flight deployments, stop refreshing and close connections
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        info!("Shutting down application state...");
        self.orchestrator.shutdown().await;
        self.refresh_pool.stop().await;
        self.pool.close_all().await;
        Ok(())
    }
}
