//! Deployment orchestrator
//!
//! Drives an application through create, upgrade and delete on its VPS.
//! Create and upgrade are fail-fast with no rollback: the first failing step
//! moves the record to `Failed`. Delete and teardown are best-effort per step
//! and always remove the KV records.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::{ApplicationFsm, ApplicationStatus, LifecycleEvent};
use crate::deploy::helm::{parse_release_status, ClusterCommands, ReleaseStatus, RELEASE_NOT_FOUND};
use crate::deploy::locks::AppLocks;
use crate::deploy::naming::{derive_namespace, derive_release_name, tls_secret_name};
use crate::deploy::plan::{dns_record_names, ChartSource, DeploymentPlan, GeneratedCredential, PlanStep};
use crate::errors::EngineError;
use crate::gateways::catalog::Catalog;
use crate::gateways::{CertificateIssuer, DnsGateway, TlsBundle};
use crate::kv::{keys, KvStore, KvStoreExt};
use crate::models::application::{Application, CreateApplicationRequest};
use crate::models::catalog::CatalogEntry;
use crate::models::vps::VpsConfig;
use crate::secrets;
use crate::ssh::executor::{self, CommandResult};
use crate::ssh::pool::Connection;
use crate::ssh::session::{Session, SessionManager};
use crate::ssh::SshCredential;
use crate::utils::generate_short_id;
use crate::versions::VersionSource;

/// Local deadline of a release command beyond the package manager's own timeout
const DEADLINE_GRACE: Duration = Duration::from_secs(30);

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Bound on `helm install`/`helm upgrade --wait`
    pub install_timeout: Duration,

    /// Kubeconfig path on the VPS
    pub kubeconfig: String,

    /// Scratch directory on the VPS for chart checkouts and values files
    pub scratch_dir: String,

    /// Directory on the VPS receiving uploaded TLS material
    pub tls_dir: String,

    /// Namespace of the cluster TLS secret
    pub tls_secret_namespace: String,

    /// Command restarting the ingress controller after a TLS secret change
    pub ingress_restart_command: String,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            install_timeout: Duration::from_secs(600),
            kubeconfig: "/etc/rancher/k3s/k3s.yaml".to_string(),
            scratch_dir: "/tmp/kubedeck".to_string(),
            tls_dir: "/etc/kubedeck/tls".to_string(),
            tls_secret_namespace: "kube-system".to_string(),
            ingress_restart_command: "kubectl -n kube-system rollout restart deployment traefik".to_string(),
        }
    }
}

/// Services the orchestrator depends on
#[derive(Clone)]
pub struct Collaborators {
    pub kv: Arc<dyn KvStore>,
    pub catalog: Arc<dyn Catalog>,
    pub dns: Arc<dyn DnsGateway>,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub sessions: Arc<SessionManager>,
    pub versions: Arc<dyn VersionSource>,
}

/// Value stored under the per-VPS TLS marker
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TlsMarker {
    secret: String,
    configured_at: DateTime<Utc>,
}

/// An application run holding its per-ID lock
struct Run {
    app: Application,
    entry: CatalogEntry,
    fsm: ApplicationFsm,
    _guard: OwnedMutexGuard<()>,
}

pub struct Orchestrator {
    kv: Arc<dyn KvStore>,
    catalog: Arc<dyn Catalog>,
    dns: Arc<dyn DnsGateway>,
    issuer: Arc<dyn CertificateIssuer>,
    sessions: Arc<SessionManager>,
    versions: Arc<dyn VersionSource>,
    commands: ClusterCommands,
    options: DeployOptions,
    locks: AppLocks,
    tasks: TaskTracker,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, options: DeployOptions) -> Self {
        Self {
            kv: collaborators.kv,
            catalog: collaborators.catalog,
            dns: collaborators.dns,
            issuer: collaborators.issuer,
            sessions: collaborators.sessions,
            versions: collaborators.versions,
            commands: ClusterCommands::new(options.kubeconfig.clone()),
            options,
            locks: AppLocks::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    // =================================== READS =================================== //

    pub async fn get_application(&self, id: &str) -> Result<Application, EngineError> {
        self.kv
            .get_json::<Application>(&keys::app(id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("application {}", id)))
    }

    /// All application records, optionally restricted to one VPS, oldest first.
    ///
    /// Unreadable records are skipped with a warning.
    pub async fn list_applications(&self, vps_id: Option<&str>) -> Result<Vec<Application>, EngineError> {
        let mut apps = Vec::new();
        for key in self.kv.list_keys(keys::APP_PREFIX).await? {
            if keys::app_id_from_key(&key).is_none() {
                continue;
            }
            match self.kv.get_json::<Application>(&key).await {
                Ok(Some(app)) => {
                    if vps_id.map_or(true, |v| app.vps_id == v) {
                        apps.push(app);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable application record {}: {}", key, e),
            }
        }
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apps)
    }

    /// Ask the cluster for the release status of an application.
    ///
    /// Never persisted: the record's status only changes through a run.
    pub async fn real_time_status(
        &self,
        id: &str,
        caller_token: &SecretString,
    ) -> Result<ReleaseStatus, EngineError> {
        let app = self.get_application(id).await?;
        let vps = self.vps_config(&app.vps_id).await?;
        let session = self.open_session(&app.vps_id, &vps, caller_token).await?;

        let result = executor::execute(
            session.connection(),
            &self.commands.status(&app.release_name, &app.namespace),
        )
        .await;
        self.sessions.release_session(&session.id).await;

        let raw = if result.success() {
            parse_release_status(&result.output)
        } else {
            debug!(
                "helm status for {} failed (exit {}), treating as {}",
                app.release_name, result.exit_code, RELEASE_NOT_FOUND
            );
            Some(RELEASE_NOT_FOUND.to_string())
        };
        let status = ReleaseStatus::from_raw(raw.as_deref());
        debug!("Application {} release status: {}", id, status);
        Ok(status)
    }

    // =================================== CREATE =================================== //

    /// Create an application and run its deployment to completion.
    ///
    /// On failure the record is left in `Failed` and the error returned.
    pub async fn create_application(
        &self,
        request: CreateApplicationRequest,
        caller_token: &SecretString,
    ) -> Result<Application, EngineError> {
        let run = self.begin_create(request).await?;
        self.run_create(run, caller_token).await
    }

    /// Persist the new record, then deploy on a background task.
    ///
    /// Returns the record in `Creating`; progress is observed through
    /// [`Orchestrator::get_application`].
    pub async fn submit_create(
        self: &Arc<Self>,
        request: CreateApplicationRequest,
        caller_token: &SecretString,
    ) -> Result<Application, EngineError> {
        let run = self.begin_create(request).await?;
        let snapshot = run.app.clone();
        let this = Arc::clone(self);
        let token = SecretString::from(caller_token.expose_secret().to_string());
        self.tasks.spawn(async move {
            let _ = this.run_create(run, &token).await;
        });
        Ok(snapshot)
    }

    /// Re-run the create pipeline of a `Failed` application
    pub async fn retry_application(
        &self,
        id: &str,
        caller_token: &SecretString,
    ) -> Result<Application, EngineError> {
        let guard = self.locks.lock(id).await;
        let mut app = self.get_application(id).await?;
        let entry = self.catalog.get(&app.app_type).await?;
        let mut fsm = ApplicationFsm::from_status(app.status.clone());
        self.apply_event(&mut app, &mut fsm, LifecycleEvent::Retry).await?;

        // A failed install leaves a release behind under the same name
        if let Err(e) = self.uninstall_release(&app, caller_token).await {
            debug!("No stale release removed for {}: {}", id, e);
        }

        let run = Run {
            app,
            entry,
            fsm,
            _guard: guard,
        };
        self.run_create(run, caller_token).await
    }

    /// Validate the request, derive names and persist the `Creating` record
    async fn begin_create(&self, request: CreateApplicationRequest) -> Result<Run, EngineError> {
        if request.domain.trim().is_empty() {
            return Err(EngineError::ValidationError("domain is required".to_string()));
        }
        if request.vps_id.trim().is_empty() {
            return Err(EngineError::ValidationError("vps_id is required".to_string()));
        }

        let entry = self.catalog.get(&request.app_type).await?;
        let version = match request.version.filter(|v| !v.trim().is_empty()) {
            Some(version) => version,
            None => self.versions.latest_version(&entry.id).await?,
        };

        let id = generate_short_id();
        let guard = self.locks.lock(&id).await;
        let now = Utc::now();
        let app = Application {
            namespace: derive_namespace(&entry.id, entry.chart.namespace.as_deref()),
            release_name: derive_release_name(&entry.id, &request.subdomain, &id),
            name: request.name.unwrap_or_else(|| entry.name.clone()),
            app_type: entry.id.clone(),
            version,
            subdomain: request.subdomain.trim().to_lowercase(),
            domain: request.domain.trim().to_lowercase(),
            vps_id: request.vps_id,
            status: ApplicationStatus::Creating,
            url: None,
            created_at: now,
            updated_at: now,
            id,
        };
        self.save(&app).await?;
        info!(
            "Application {} created: {} {} as release {} in namespace {}",
            app.id, app.app_type, app.version, app.release_name, app.namespace
        );

        Ok(Run {
            fsm: ApplicationFsm::from_status(app.status.clone()),
            app,
            entry,
            _guard: guard,
        })
    }

    async fn run_create(&self, run: Run, caller_token: &SecretString) -> Result<Application, EngineError> {
        let Run {
            mut app,
            entry,
            mut fsm,
            _guard,
        } = run;

        match self.create_pipeline(&mut app, &entry, &mut fsm, caller_token).await {
            Ok(()) => {
                app.url = Some(app.public_url());
                self.apply_event(&mut app, &mut fsm, LifecycleEvent::DeploySuccess)
                    .await?;
                info!("Application {} is running at {}", app.id, app.public_url());
                Ok(app)
            }
            Err(e) => {
                error!("Deployment of application {} failed: {}", app.id, e);
                self.record_failure(&mut app, &mut fsm, LifecycleEvent::DeployFailed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn create_pipeline(
        &self,
        app: &mut Application,
        entry: &CatalogEntry,
        fsm: &mut ApplicationFsm,
        caller_token: &SecretString,
    ) -> Result<(), EngineError> {
        let vps = self.vps_config(&app.vps_id).await?;
        let session = self.open_session(&app.vps_id, &vps, caller_token).await?;
        let result = self
            .deploy_on(&session, app, entry, fsm, &vps, caller_token)
            .await;
        self.sessions.release_session(&session.id).await;
        result
    }

    async fn deploy_on(
        &self,
        session: &Session,
        app: &mut Application,
        entry: &CatalogEntry,
        fsm: &mut ApplicationFsm,
        vps: &VpsConfig,
        caller_token: &SecretString,
    ) -> Result<(), EngineError> {
        self.apply_event(app, fsm, LifecycleEvent::Deploy).await?;
        let plan = DeploymentPlan::for_create(app, entry, vps, &self.options.scratch_dir);
        self.run_plan(session.connection(), app, vps, &plan, caller_token)
            .await
    }

    // =================================== UPGRADE =================================== //

    /// Upgrade an application to `new_version` and wait for the outcome
    pub async fn upgrade_application(
        &self,
        id: &str,
        new_version: &str,
        caller_token: &SecretString,
    ) -> Result<Application, EngineError> {
        let run = self.begin_upgrade(id, new_version).await?;
        self.run_upgrade(run, caller_token).await
    }

    /// Persist `Updating`, then upgrade on a background task
    pub async fn submit_upgrade(
        self: &Arc<Self>,
        id: &str,
        new_version: &str,
        caller_token: &SecretString,
    ) -> Result<Application, EngineError> {
        let run = self.begin_upgrade(id, new_version).await?;
        let snapshot = run.app.clone();
        let this = Arc::clone(self);
        let token = SecretString::from(caller_token.expose_secret().to_string());
        self.tasks.spawn(async move {
            let _ = this.run_upgrade(run, &token).await;
        });
        Ok(snapshot)
    }

    async fn begin_upgrade(&self, id: &str, new_version: &str) -> Result<Run, EngineError> {
        if new_version.trim().is_empty() {
            return Err(EngineError::ValidationError("version is required".to_string()));
        }

        let guard = self.locks.lock(id).await;
        let mut app = self.get_application(id).await?;
        let entry = self.catalog.get(&app.app_type).await?;

        let mut fsm = ApplicationFsm::from_status(app.status.clone());
        let previous = app.version.clone();
        app.version = new_version.trim().to_string();
        self.apply_event(&mut app, &mut fsm, LifecycleEvent::Upgrade).await?;
        info!("Upgrading application {} from {} to {}", id, previous, app.version);

        Ok(Run {
            app,
            entry,
            fsm,
            _guard: guard,
        })
    }

    async fn run_upgrade(&self, run: Run, caller_token: &SecretString) -> Result<Application, EngineError> {
        let Run {
            mut app,
            entry,
            mut fsm,
            _guard,
        } = run;

        match self.upgrade_pipeline(&app, &entry, caller_token).await {
            Ok(()) => {
                self.apply_event(&mut app, &mut fsm, LifecycleEvent::UpgradeSuccess)
                    .await?;
                info!("Application {} upgraded to {}", app.id, app.version);
                Ok(app)
            }
            Err(e) => {
                error!("Upgrade of application {} failed: {}", app.id, e);
                self.record_failure(&mut app, &mut fsm, LifecycleEvent::UpgradeFailed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn upgrade_pipeline(
        &self,
        app: &Application,
        entry: &CatalogEntry,
        caller_token: &SecretString,
    ) -> Result<(), EngineError> {
        let vps = self.vps_config(&app.vps_id).await?;
        let session = self.open_session(&app.vps_id, &vps, caller_token).await?;
        let plan = DeploymentPlan::for_upgrade(app, entry, &vps, &self.options.scratch_dir);
        let result = self
            .run_plan(session.connection(), app, &vps, &plan, caller_token)
            .await;
        self.sessions.release_session(&session.id).await;
        result
    }

    // =================================== DELETE =================================== //

    /// Uninstall and forget an application.
    ///
    /// Remote uninstall and DNS cleanup are best-effort; the KV records are
    /// always removed. Deleting an unknown ID succeeds.
    pub async fn delete_application(&self, id: &str, caller_token: &SecretString) -> Result<(), EngineError> {
        let _guard = self.locks.lock(id).await;

        match self.get_application(id).await {
            Ok(mut app) => {
                let mut fsm = ApplicationFsm::from_status(app.status.clone());
                if let Err(e) = self.apply_event(&mut app, &mut fsm, LifecycleEvent::Delete).await {
                    warn!("Could not mark application {} as deleting: {}", id, e);
                }
                if let Err(e) = self.uninstall_release(&app, caller_token).await {
                    warn!("Uninstall of {} failed, continuing: {}", app.release_name, e);
                }
                if let Err(e) = self.remove_dns_records(&app).await {
                    warn!("DNS cleanup for {} failed, continuing: {}", app.hostname(), e);
                }
            }
            Err(e) if e.is_not_found() => {
                debug!("Application {} has no record, removing keys only", id);
            }
            Err(e) => {
                warn!("Application {} record unreadable, removing keys only: {}", id, e);
            }
        }

        self.kv.delete(&keys::app(id)).await?;
        self.kv.delete(&keys::app_password(id)).await?;
        info!("Application {} deleted", id);
        Ok(())
    }

    /// Forget every application of a VPS that is being destroyed.
    ///
    /// No remote commands are run. Returns the number of applications
    /// removed, or a `PartialFailure` listing every step that failed.
    pub async fn teardown_vps(&self, vps_id: &str) -> Result<usize, EngineError> {
        let apps = self.list_applications(Some(vps_id)).await?;
        info!("Tearing down {} applications of VPS {}", apps.len(), vps_id);

        let mut errors = Vec::new();
        for app in &apps {
            let _guard = self.locks.lock(&app.id).await;
            if let Err(e) = self.remove_dns_records(app).await {
                errors.push(format!("{}: DNS cleanup failed: {}", app.id, e));
            }
            for key in [keys::app(&app.id), keys::app_password(&app.id)] {
                if let Err(e) = self.kv.delete(&key).await {
                    errors.push(format!("{}: delete {} failed: {}", app.id, key, e));
                }
            }
        }

        // TLS markers of the server's domains
        match self.kv.get_json::<VpsConfig>(&keys::vps_config(vps_id)).await {
            Ok(Some(vps)) => {
                let domains: BTreeSet<&str> = apps.iter().map(|a| a.domain.as_str()).collect();
                for domain in domains {
                    let marker = keys::vps_ssl_marker(&vps.public_ipv4, domain);
                    if let Err(e) = self.kv.delete(&marker).await {
                        errors.push(format!("delete {} failed: {}", marker, e));
                    }
                }
            }
            Ok(None) => debug!("VPS {} has no config, no TLS markers to clear", vps_id),
            Err(e) => errors.push(format!("read config of VPS {} failed: {}", vps_id, e)),
        }

        if errors.is_empty() {
            info!("Teardown of VPS {} complete", vps_id);
            Ok(apps.len())
        } else {
            warn!("Teardown of VPS {} finished with {} errors", vps_id, errors.len());
            Err(EngineError::PartialFailure(errors))
        }
    }

    /// Wait for background runs started through `submit_*` to finish
    pub async fn shutdown(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!("Waiting for {} deployment runs to finish", self.tasks.len());
        }
        self.tasks.wait().await;
    }

    // =================================== STEPS =================================== //

    async fn run_plan(
        &self,
        conn: &Connection,
        app: &Application,
        vps: &VpsConfig,
        plan: &DeploymentPlan,
        caller_token: &SecretString,
    ) -> Result<(), EngineError> {
        let total = plan.steps.len();
        for (i, step) in plan.steps.iter().enumerate() {
            info!("Application {}: step {}/{}: {}", app.id, i + 1, total, step);
            match step {
                PlanStep::EnsureNamespace => {
                    self.run(conn, &self.commands.ensure_namespace(&plan.namespace))
                        .await?;
                }
                PlanStep::FetchChart => self.fetch_chart(conn, &plan.chart).await?,
                PlanStep::UploadValues => {
                    executor::upload(conn, &plan.values_path, &plan.values)
                        .await
                        .into_result()?;
                }
                PlanStep::Install => {
                    let command = self.commands.install(&plan.release(), self.options.install_timeout);
                    self.run_release(conn, &command).await?;
                }
                PlanStep::Upgrade => {
                    let command = self.commands.upgrade(&plan.release(), self.options.install_timeout);
                    self.run_release(conn, &command).await?;
                }
                PlanStep::ConfigureDns => self.configure_dns(app, vps).await?,
                PlanStep::ConfigureTls => self.configure_tls(conn, app, vps).await?,
                PlanStep::StoreCredential => {
                    if let Some(credential) = &plan.credential {
                        if let Err(e) = self.store_credential(conn, app, credential, caller_token).await {
                            warn!("Could not store generated credential of {}: {}", app.id, e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn run(&self, conn: &Connection, command: &str) -> Result<CommandResult, EngineError> {
        executor::execute(conn, command).await.into_result()
    }

    async fn run_release(&self, conn: &Connection, command: &str) -> Result<(), EngineError> {
        let deadline = self.options.install_timeout + DEADLINE_GRACE;
        let result = executor::execute_with_timeout(conn, command, deadline).await;
        info!(
            "Release command finished in {:?} with exit {}",
            result.duration, result.exit_code
        );
        result.into_result().map(|_| ())
    }

    async fn fetch_chart(&self, conn: &Connection, chart: &ChartSource) -> Result<(), EngineError> {
        let command = match chart {
            ChartSource::Clone {
                repository,
                checkout_dir,
                ..
            } => self.commands.clone_chart(repository, checkout_dir),
            ChartSource::HelmRepo { name, url, .. } => self.commands.add_repo(name, url),
        };
        self.run(conn, &command).await.map(|_| ())
    }

    async fn configure_dns(&self, app: &Application, vps: &VpsConfig) -> Result<(), EngineError> {
        let zone = self.dns.find_zone(&app.domain).await?;
        let configured = self
            .kv
            .get(&keys::vps_ssl_marker(&vps.public_ipv4, &app.domain))
            .await?
            .is_some();

        for name in dns_record_names(app, configured) {
            self.dns
                .upsert_a_record(&zone, &name, &vps.public_ipv4)
                .await?;
            info!("DNS A record {} -> {}", name, vps.public_ipv4);
        }
        Ok(())
    }

    async fn configure_tls(&self, conn: &Connection, app: &Application, vps: &VpsConfig) -> Result<(), EngineError> {
        let marker_key = keys::vps_ssl_marker(&vps.public_ipv4, &app.domain);
        if self.kv.get(&marker_key).await?.is_some() {
            debug!("TLS for {} already configured on {}", app.domain, vps.public_ipv4);
            return Ok(());
        }

        let bundle = self.tls_bundle(&app.domain).await?;
        let dir = format!("{}/{}", self.options.tls_dir.trim_end_matches('/'), app.domain);
        let cert_path = format!("{}/tls.crt", dir);
        let key_path = format!("{}/tls.key", dir);
        executor::upload(conn, &cert_path, &bundle.certificate)
            .await
            .into_result()?;
        executor::upload(conn, &key_path, &bundle.private_key)
            .await
            .into_result()?;

        let secret = tls_secret_name(&app.domain);
        self.run(
            conn,
            &self.commands.apply_tls_secret(
                &secret,
                &self.options.tls_secret_namespace,
                &cert_path,
                &key_path,
            ),
        )
        .await?;
        self.run(conn, &self.commands.raw(&self.options.ingress_restart_command))
            .await?;

        let marker = TlsMarker {
            secret,
            configured_at: Utc::now(),
        };
        self.kv.put_json(&marker_key, &marker).await?;
        info!("TLS configured for {} on {}", app.domain, vps.public_ipv4);
        Ok(())
    }

    /// Stored certificate bundle of a domain, issuing one if absent
    async fn tls_bundle(&self, domain: &str) -> Result<TlsBundle, EngineError> {
        let key = keys::domain_ssl_config(domain);
        if let Some(bundle) = self.kv.get_json::<TlsBundle>(&key).await? {
            return Ok(bundle);
        }

        let zone = self.dns.find_zone(domain).await?;
        let csr = self.kv.get(keys::SSL_CSR).await?;
        let bundle = self.issuer.issue(domain, &zone, csr.as_deref()).await?;
        self.kv.put_json(&key, &bundle).await?;
        info!("Issued certificate for {}", domain);
        Ok(bundle)
    }

    async fn store_credential(
        &self,
        conn: &Connection,
        app: &Application,
        credential: &GeneratedCredential,
        caller_token: &SecretString,
    ) -> Result<(), EngineError> {
        let command = self
            .commands
            .read_secret(&credential.secret, &credential.key, &app.namespace);
        let result = self.run(conn, &command).await?;

        let encoded = result.trimmed_output();
        if encoded.is_empty() {
            return Err(EngineError::NotFound(format!(
                "key {} of secret {}",
                credential.key, credential.secret
            )));
        }
        let decoded = BASE64
            .decode(encoded)
            .map_err(|e| EngineError::Parse(format!("secret is not base64: {}", e)))?;
        let plaintext = String::from_utf8(decoded)
            .map_err(|e| EngineError::Parse(format!("secret is not UTF-8: {}", e)))?;

        let sealed = secrets::encrypt(&plaintext, &secrets::derive_key(caller_token))?;
        self.kv.put(&keys::app_password(&app.id), sealed).await?;
        debug!("Stored generated credential of {}", app.id);
        Ok(())
    }

    async fn uninstall_release(&self, app: &Application, caller_token: &SecretString) -> Result<(), EngineError> {
        let vps = self.vps_config(&app.vps_id).await?;
        let session = self.open_session(&app.vps_id, &vps, caller_token).await?;
        let result = self
            .run(
                session.connection(),
                &self.commands.uninstall(&app.release_name, &app.namespace),
            )
            .await;
        self.sessions.release_session(&session.id).await;
        result.map(|_| ())
    }

    async fn remove_dns_records(&self, app: &Application) -> Result<(), EngineError> {
        let needs_dns = match self.catalog.get(&app.app_type).await {
            Ok(entry) => entry.needs_dns,
            Err(_) => true,
        };
        if !needs_dns || app.domain.is_empty() {
            return Ok(());
        }

        let zone = self.dns.find_zone(&app.domain).await?;
        let name = app.hostname();
        self.dns.delete_a_record(&zone, &name).await?;
        info!("Removed DNS A record {}", name);
        Ok(())
    }

    // =================================== HELPERS =================================== //

    async fn vps_config(&self, vps_id: &str) -> Result<VpsConfig, EngineError> {
        self.kv
            .get_json::<VpsConfig>(&keys::vps_config(vps_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("VPS {} config", vps_id)))
    }

    async fn ssh_credential(&self) -> Result<SshCredential, EngineError> {
        let pem = self
            .kv
            .get(keys::SSH_PRIVATE_KEY)
            .await?
            .ok_or_else(|| EngineError::ConfigError("SSH private key is not configured".to_string()))?;
        SshCredential::from_pem(&pem)
    }

    async fn open_session(
        &self,
        vps_id: &str,
        vps: &VpsConfig,
        caller_token: &SecretString,
    ) -> Result<Session, EngineError> {
        let credential = self.ssh_credential().await?;
        self.sessions
            .create_session(
                vps_id,
                &vps.public_ipv4,
                vps.ssh_port,
                &vps.ssh_user,
                credential,
                caller_token,
            )
            .await
    }

    async fn save(&self, app: &Application) -> Result<(), EngineError> {
        self.kv.put_json(&keys::app(&app.id), app).await
    }

    /// Advance the lifecycle and persist the new status
    async fn apply_event(
        &self,
        app: &mut Application,
        fsm: &mut ApplicationFsm,
        event: LifecycleEvent,
    ) -> Result<(), EngineError> {
        let next = fsm.process(event)?.clone();
        info!("Application {}: {} -> {}", app.id, app.status, next);
        app.status = next;
        app.touch();
        self.save(app).await
    }

    async fn record_failure(&self, app: &mut Application, fsm: &mut ApplicationFsm, event: LifecycleEvent) {
        if let Err(e) = self.apply_event(app, fsm, event).await {
            error!("Could not record failure of application {}: {}", app.id, e);
        }
    }
}
