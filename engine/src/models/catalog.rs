//! Catalog models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Repository hosts whose URLs are cloned rather than added as Helm repos
const SOURCE_CONTROL_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org"];

/// A predefined application template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Unique entry ID, also the application type
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Default version to deploy
    pub version: String,

    /// Whether the application needs DNS records and TLS
    #[serde(default = "default_true")]
    pub needs_dns: bool,

    pub chart: ChartSpec,
}

fn default_true() -> bool {
    true
}

/// Where a chart comes from and how it is configured
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    /// Helm repository URL or source-control repository URL
    pub repository: String,

    /// Chart name within the Helm repository, or chart path within the clone
    pub chart: String,

    /// Chart version pin, only meaningful for Helm repositories
    #[serde(default)]
    pub version: Option<String>,

    /// Target namespace, defaults to the entry ID
    #[serde(default)]
    pub namespace: Option<String>,

    /// Values document with `{{PLACEHOLDER}}` markers
    #[serde(default)]
    pub values_template: String,

    /// Extra placeholder values merged over the built-in set
    #[serde(default)]
    pub placeholders: BTreeMap<String, String>,
}

impl ChartSpec {
    /// True when the repository is hosted on a source-control service
    pub fn is_source_control(&self) -> bool {
        let repo = self.repository.to_lowercase();
        repo.ends_with(".git") || SOURCE_CONTROL_HOSTS.iter().any(|host| repo.contains(host))
    }

    /// `owner/repo` for GitHub-hosted repositories
    pub fn github_slug(&self) -> Option<String> {
        let rest = self
            .repository
            .split("github.com/")
            .nth(1)?
            .trim_end_matches('/')
            .trim_end_matches(".git");
        let mut parts = rest.split('/');
        let owner = parts.next().filter(|s| !s.is_empty())?;
        let repo = parts.next().filter(|s| !s.is_empty())?;
        Some(format!("{}/{}", owner, repo))
    }
}
