//! VPS models

use serde::{Deserialize, Serialize};

/// Connection details of a provisioned server, as persisted by the provisioning flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpsConfig {
    /// Provider-side server ID
    pub server_id: String,

    pub public_ipv4: String,

    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    #[serde(default)]
    pub provider: String,

    /// IANA timezone passed into rendered values
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_timezone() -> String {
    "UTC".to_string()
}
