//! Application models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::ApplicationStatus;

/// One user-deployed catalog entry bound to a VPS, subdomain and domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    /// Unique application ID
    pub id: String,

    /// Display name
    pub name: String,

    /// Catalog entry ID (e.g. "code-server")
    #[serde(rename = "type")]
    pub app_type: String,

    /// Chart/application version being deployed
    pub version: String,

    /// Subdomain the application is served on, empty for the apex domain
    #[serde(default)]
    pub subdomain: String,

    pub domain: String,

    pub vps_id: String,

    /// Kubernetes namespace of the release
    pub namespace: String,

    /// Helm release name
    pub release_name: String,

    pub status: ApplicationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Application {
    /// Fully-qualified host name the application answers on
    pub fn hostname(&self) -> String {
        if self.subdomain.is_empty() {
            self.domain.clone()
        } else {
            format!("{}.{}", self.subdomain, self.domain)
        }
    }

    /// Public URL of the application
    pub fn public_url(&self) -> String {
        format!("https://{}", self.hostname())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Request to create a new application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateApplicationRequest {
    /// Display name, defaults to the catalog entry name
    #[serde(default)]
    pub name: Option<String>,

    /// Catalog entry ID
    #[serde(rename = "type")]
    pub app_type: String,

    /// Version to deploy, defaults to the latest known version
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub subdomain: String,

    pub domain: String,

    pub vps_id: String,
}
