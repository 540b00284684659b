//! Remote cluster commands and release status parsing

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::deploy::fsm::ApplicationStatus;
use crate::utils::shell_quote;

/// Sentinel raw status reported when `helm status` itself fails
pub const RELEASE_NOT_FOUND: &str = "not-found";

/// Builds the shell commands run on a VPS, each with the cluster kubeconfig
/// exported
#[derive(Debug, Clone)]
pub struct ClusterCommands {
    kubeconfig: String,
}

impl ClusterCommands {
    pub fn new(kubeconfig: impl Into<String>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }

    fn with_env(&self, command: String) -> String {
        format!("export KUBECONFIG={}; {}", shell_quote(&self.kubeconfig), command)
    }

    /// Create the namespace unless it already exists
    pub fn ensure_namespace(&self, namespace: &str) -> String {
        self.with_env(format!(
            "kubectl create namespace {} --dry-run=client -o yaml | kubectl apply -f -",
            shell_quote(namespace)
        ))
    }

    /// Shallow clone into `dest`, replacing any previous checkout
    pub fn clone_chart(&self, repository: &str, dest: &str) -> String {
        let dest = shell_quote(dest);
        format!(
            "rm -rf {dest} && git clone --depth 1 {} {dest}",
            shell_quote(repository)
        )
    }

    /// Add or refresh a Helm repository reference
    pub fn add_repo(&self, name: &str, url: &str) -> String {
        self.with_env(format!(
            "helm repo add {} {} --force-update && helm repo update {}",
            shell_quote(name),
            shell_quote(url),
            shell_quote(name)
        ))
    }

    pub fn install(&self, release: &ReleaseSpec<'_>, timeout: Duration) -> String {
        self.release_command("install", release, timeout)
    }

    pub fn upgrade(&self, release: &ReleaseSpec<'_>, timeout: Duration) -> String {
        self.release_command("upgrade", release, timeout)
    }

    fn release_command(&self, verb: &str, release: &ReleaseSpec<'_>, timeout: Duration) -> String {
        let mut command = format!(
            "helm {} {} {} --namespace {} --values {}",
            verb,
            shell_quote(release.name),
            shell_quote(release.chart_ref),
            shell_quote(release.namespace),
            shell_quote(release.values_path)
        );
        if let Some(version) = release.chart_version {
            command.push_str(&format!(" --version {}", shell_quote(version)));
        }
        command.push_str(&format!(" --wait --timeout {}", format_timeout(timeout)));
        self.with_env(command)
    }

    pub fn uninstall(&self, release: &str, namespace: &str) -> String {
        self.with_env(format!(
            "helm uninstall {} --namespace {}",
            shell_quote(release),
            shell_quote(namespace)
        ))
    }

    pub fn status(&self, release: &str, namespace: &str) -> String {
        self.with_env(format!(
            "helm status {} --namespace {} -o json",
            shell_quote(release),
            shell_quote(namespace)
        ))
    }

    /// Print one base64-encoded key of a cluster secret
    pub fn read_secret(&self, secret: &str, key: &str, namespace: &str) -> String {
        let jsonpath = format!("{{.data.{}}}", key.replace('.', "\\."));
        self.with_env(format!(
            "kubectl get secret {} -n {} -o jsonpath={}",
            shell_quote(secret),
            shell_quote(namespace),
            shell_quote(&jsonpath)
        ))
    }

    /// Create or replace a TLS secret from uploaded PEM files
    pub fn apply_tls_secret(&self, name: &str, namespace: &str, cert_path: &str, key_path: &str) -> String {
        self.with_env(format!(
            "kubectl create secret tls {} -n {} --cert={} --key={} --dry-run=client -o yaml | kubectl apply -f -",
            shell_quote(name),
            shell_quote(namespace),
            shell_quote(cert_path),
            shell_quote(key_path)
        ))
    }

    /// Run an operator-supplied command with the kubeconfig exported
    pub fn raw(&self, command: &str) -> String {
        self.with_env(command.to_string())
    }
}

/// Arguments shared by install and upgrade
#[derive(Debug, Clone, Copy)]
pub struct ReleaseSpec<'a> {
    pub name: &'a str,
    pub chart_ref: &'a str,
    pub namespace: &'a str,
    pub values_path: &'a str,
    pub chart_version: Option<&'a str>,
}

/// Helm duration syntax, e.g. `10m` or `90s`
fn format_timeout(timeout: Duration) -> String {
    let secs = timeout.as_secs().max(1);
    if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[derive(Debug, Deserialize)]
struct HelmStatusDocument {
    info: Option<HelmStatusInfo>,
}

#[derive(Debug, Deserialize)]
struct HelmStatusInfo {
    status: Option<String>,
}

/// Extract the raw release status from `helm status -o json` output.
///
/// Returns `None` for empty or malformed output.
pub fn parse_release_status(output: &str) -> Option<String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }
    let doc: HelmStatusDocument = serde_json::from_str(trimmed).ok()?;
    doc.info?
        .status
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Observed state of a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// A status with a lifecycle counterpart
    Mapped(ApplicationStatus),

    /// Any other package-manager status, passed through verbatim
    Other(String),
}

impl ReleaseStatus {
    /// Map a raw status. `None` (empty or malformed output) is `Unknown`.
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw {
            None => ReleaseStatus::Mapped(ApplicationStatus::Unknown),
            Some("deployed") => ReleaseStatus::Mapped(ApplicationStatus::Running),
            Some("failed") => ReleaseStatus::Mapped(ApplicationStatus::Failed),
            Some("pending-install") | Some("pending-upgrade") => {
                ReleaseStatus::Mapped(ApplicationStatus::Deploying)
            }
            Some(RELEASE_NOT_FOUND) => ReleaseStatus::Mapped(ApplicationStatus::NotDeployed),
            Some(other) => ReleaseStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReleaseStatus::Mapped(status) => status.as_str(),
            ReleaseStatus::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
