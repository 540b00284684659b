//! Latest-version sources

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use tracing::debug;

use crate::cache::version::VersionCache;
use crate::errors::EngineError;
use crate::gateways::catalog::Catalog;

/// Fetches the latest upstream version of a catalog application
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn latest_version(&self, app_id: &str) -> Result<String, EngineError>;
}

/// Strip a leading `v` from release tags such as `v4.20.0`
pub fn normalize_version(tag: &str) -> String {
    let tag = tag.trim();
    match tag.strip_prefix('v').or_else(|| tag.strip_prefix('V')) {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest.to_string(),
        _ => tag.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
}

/// Latest release tag of GitHub-hosted catalog entries
pub struct GithubReleaseSource {
    client: Client,
    api_base: String,
    catalog: Arc<dyn Catalog>,
}

impl GithubReleaseSource {
    pub fn new(catalog: Arc<dyn Catalog>, api_base: &str, timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("kubedeck/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            catalog,
        })
    }
}

#[async_trait]
impl VersionSource for GithubReleaseSource {
    async fn latest_version(&self, app_id: &str) -> Result<String, EngineError> {
        let entry = self.catalog.get(app_id).await?;
        let slug = entry.chart.github_slug().ok_or_else(|| {
            EngineError::NotFound(format!("{} is not hosted on GitHub", app_id))
        })?;

        let url = format!("{}/repos/{}/releases/latest", self.api_base, slug);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::GatewayError(format!("{}: {}", status, body)));
        }

        let release: GithubRelease = response.json().await?;
        Ok(normalize_version(&release.tag_name))
    }
}

/// Asks an upstream source and falls back to the catalog's pinned version
pub struct CatalogVersionSource {
    catalog: Arc<dyn Catalog>,
    upstream: Option<Arc<dyn VersionSource>>,
}

impl CatalogVersionSource {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            upstream: None,
        }
    }

    pub fn with_upstream(mut self, upstream: Arc<dyn VersionSource>) -> Self {
        self.upstream = Some(upstream);
        self
    }
}

#[async_trait]
impl VersionSource for CatalogVersionSource {
    async fn latest_version(&self, app_id: &str) -> Result<String, EngineError> {
        let entry = self.catalog.get(app_id).await?;
        if let Some(upstream) = &self.upstream {
            match upstream.latest_version(app_id).await {
                Ok(version) => return Ok(version),
                Err(e) => debug!("Upstream version of {} unavailable, using pinned: {}", app_id, e),
            }
        }
        Ok(entry.version)
    }
}

/// Read-through cache in front of another source.
///
/// A fresh cached version is returned without asking `source`; a miss fetches
/// and stores the result. Errors are never cached.
pub struct CachedVersionSource {
    cache: Arc<VersionCache>,
    source: Arc<dyn VersionSource>,
}

impl CachedVersionSource {
    pub fn new(cache: Arc<VersionCache>, source: Arc<dyn VersionSource>) -> Self {
        Self { cache, source }
    }
}

#[async_trait]
impl VersionSource for CachedVersionSource {
    async fn latest_version(&self, app_id: &str) -> Result<String, EngineError> {
        if let Some(version) = self.cache.get(app_id) {
            debug!("Version cache hit for {}: {}", app_id, version);
            return Ok(version);
        }

        let version = self.source.latest_version(app_id).await?;
        self.cache.insert(app_id, version.clone());
        Ok(version)
    }
}
