//! Deployment plans
//!
//! A plan is computed up front from the application record, its catalog entry
//! and the VPS configuration. The orchestrator then walks its steps in order.

use std::collections::BTreeMap;
use std::fmt;

use crate::deploy::helm::ReleaseSpec;
use crate::deploy::naming::sanitize_label;
use crate::models::application::Application;
use crate::models::catalog::CatalogEntry;
use crate::models::vps::VpsConfig;

/// Cluster secret holding a credential generated at install time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCredential {
    pub secret: String,
    pub key: String,
}

/// Application types whose charts generate a credential, with the secret key
/// holding it. The secret is named after the release.
const GENERATED_CREDENTIALS: &[(&str, &str)] = &[
    ("code-server", "password"),
    ("grafana", "admin-password"),
    ("jenkins", "jenkins-admin-password"),
    ("wordpress", "wordpress-password"),
];

pub fn generated_credential(app_type: &str, release_name: &str) -> Option<GeneratedCredential> {
    GENERATED_CREDENTIALS
        .iter()
        .find(|(t, _)| *t == app_type)
        .map(|(_, key)| GeneratedCredential {
            secret: release_name.to_string(),
            key: key.to_string(),
        })
}

/// Where the chart is fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartSource {
    /// Source-control repository cloned onto the VPS
    Clone {
        repository: String,
        checkout_dir: String,
        chart_path: String,
    },

    /// Helm chart repository added by name
    HelmRepo {
        name: String,
        url: String,
        chart_ref: String,
        version: Option<String>,
    },
}

impl ChartSource {
    pub fn resolve(entry: &CatalogEntry, work_dir: &str) -> Self {
        let chart = &entry.chart;
        if chart.is_source_control() {
            let checkout_dir = format!("{}/chart-src", work_dir);
            let chart_path = match chart.chart.trim_matches('/') {
                "" => checkout_dir.clone(),
                path => format!("{}/{}", checkout_dir, path),
            };
            ChartSource::Clone {
                repository: chart.repository.clone(),
                checkout_dir,
                chart_path,
            }
        } else {
            let name = sanitize_label(&entry.id);
            let chart_name = chart.chart.rsplit('/').next().unwrap_or(&chart.chart);
            ChartSource::HelmRepo {
                chart_ref: format!("{}/{}", name, chart_name),
                name,
                url: chart.repository.clone(),
                version: chart.version.clone(),
            }
        }
    }

    /// Argument passed to `helm install`/`helm upgrade`
    pub fn chart_ref(&self) -> &str {
        match self {
            ChartSource::Clone { chart_path, .. } => chart_path,
            ChartSource::HelmRepo { chart_ref, .. } => chart_ref,
        }
    }

    pub fn chart_version(&self) -> Option<&str> {
        match self {
            ChartSource::Clone { .. } => None,
            ChartSource::HelmRepo { version, .. } => version.as_deref(),
        }
    }
}

/// One step of a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStep {
    EnsureNamespace,
    FetchChart,
    UploadValues,
    Install,
    Upgrade,
    ConfigureDns,
    ConfigureTls,
    StoreCredential,
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStep::EnsureNamespace => "ensure namespace",
            PlanStep::FetchChart => "fetch chart",
            PlanStep::UploadValues => "upload values",
            PlanStep::Install => "install release",
            PlanStep::Upgrade => "upgrade release",
            PlanStep::ConfigureDns => "configure DNS",
            PlanStep::ConfigureTls => "configure TLS",
            PlanStep::StoreCredential => "store credential",
        };
        f.write_str(s)
    }
}

/// Everything needed to run one create or upgrade
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub release_name: String,
    pub namespace: String,
    pub chart: ChartSource,
    pub values_path: String,
    pub values: String,
    pub credential: Option<GeneratedCredential>,
    pub steps: Vec<PlanStep>,
}

impl DeploymentPlan {
    pub fn for_create(app: &Application, entry: &CatalogEntry, vps: &VpsConfig, scratch_dir: &str) -> Self {
        let mut steps = vec![
            PlanStep::EnsureNamespace,
            PlanStep::FetchChart,
            PlanStep::UploadValues,
            PlanStep::Install,
        ];
        if entry.needs_dns {
            steps.push(PlanStep::ConfigureDns);
            steps.push(PlanStep::ConfigureTls);
        }
        let credential = generated_credential(&app.app_type, &app.release_name);
        if credential.is_some() {
            steps.push(PlanStep::StoreCredential);
        }
        Self::build(app, entry, vps, scratch_dir, credential, steps)
    }

    pub fn for_upgrade(app: &Application, entry: &CatalogEntry, vps: &VpsConfig, scratch_dir: &str) -> Self {
        let steps = vec![PlanStep::FetchChart, PlanStep::UploadValues, PlanStep::Upgrade];
        Self::build(app, entry, vps, scratch_dir, None, steps)
    }

    fn build(
        app: &Application,
        entry: &CatalogEntry,
        vps: &VpsConfig,
        scratch_dir: &str,
        credential: Option<GeneratedCredential>,
        steps: Vec<PlanStep>,
    ) -> Self {
        let work_dir = format!("{}/{}", scratch_dir.trim_end_matches('/'), app.release_name);
        let values = render_values(&entry.chart.values_template, &placeholder_values(app, entry, vps));
        Self {
            release_name: app.release_name.clone(),
            namespace: app.namespace.clone(),
            chart: ChartSource::resolve(entry, &work_dir),
            values_path: format!("{}/values.yaml", work_dir),
            values,
            credential,
            steps,
        }
    }

    pub fn release(&self) -> ReleaseSpec<'_> {
        ReleaseSpec {
            name: &self.release_name,
            chart_ref: self.chart.chart_ref(),
            namespace: &self.namespace,
            values_path: &self.values_path,
            chart_version: self.chart.chart_version(),
        }
    }
}

/// A records to upsert for an application.
///
/// The first application on a domain provisions the whole domain (root,
/// wildcard and `www`); later ones only add their own host name.
pub fn dns_record_names(app: &Application, domain_configured: bool) -> Vec<String> {
    if !domain_configured {
        return vec![
            app.domain.clone(),
            format!("*.{}", app.domain),
            format!("www.{}", app.domain),
        ];
    }
    vec![app.hostname()]
}

/// Built-in placeholders with the catalog's extras merged over them
pub fn placeholder_values(app: &Application, entry: &CatalogEntry, vps: &VpsConfig) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    values.insert("VERSION".to_string(), app.version.clone());
    values.insert("SUBDOMAIN".to_string(), app.subdomain.clone());
    values.insert("DOMAIN".to_string(), app.domain.clone());
    values.insert("HOSTNAME".to_string(), app.hostname());
    values.insert("RELEASE_NAME".to_string(), app.release_name.clone());
    values.insert("NAMESPACE".to_string(), app.namespace.clone());
    values.insert("TIMEZONE".to_string(), vps.timezone.clone());
    values.insert("APP_ID".to_string(), app.id.clone());
    for (key, value) in &entry.chart.placeholders {
        values.insert(key.clone(), value.clone());
    }
    values
}

/// Replace every `{{KEY}}` in `template`. Unknown markers are left untouched.
pub fn render_values(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match values.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
