//! Orchestrator tests against the scripted transport

use kubedeck::deploy::fsm::ApplicationStatus;
use kubedeck::deploy::helm::ReleaseStatus;
use kubedeck::errors::EngineError;
use kubedeck::kv::{keys, KvStore};
use kubedeck::secrets;

use crate::common::{request, token, Fixture, VPS_ID, VPS_IP};

#[tokio::test]
async fn test_create_code_server_end_to_end() {
    let fx = Fixture::new().await;

    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();

    assert_eq!(app.status, ApplicationStatus::Running);
    assert_eq!(app.namespace, "code-server");
    assert_eq!(app.release_name, "code-server-app1");
    assert_eq!(app.version, "4.9.0");
    assert_eq!(app.url.as_deref(), Some("https://app1.example.com"));

    let commands = fx.dialer.commands();
    assert!(commands[0].contains("kubectl create namespace code-server"));
    assert_eq!(
        fx.dialer
            .commands_matching(
                "git clone --depth 1 https://github.com/coder/code-server /tmp/kubedeck/code-server-app1/chart-src"
            )
            .len(),
        1
    );
    let installs = fx.dialer.commands_matching("helm install");
    assert_eq!(installs.len(), 1);
    assert!(installs[0].contains(
        "helm install code-server-app1 /tmp/kubedeck/code-server-app1/chart-src/ci/helm-chart --namespace code-server"
    ));
    assert!(installs[0].contains("--values /tmp/kubedeck/code-server-app1/values.yaml --wait --timeout 10m"));

    let values = fx
        .dialer
        .inputs()
        .into_iter()
        .find(|(command, _)| command.contains("values.yaml"))
        .map(|(_, input)| input)
        .unwrap();
    assert_eq!(values, "image:\n  tag: 4.9.0\ningress:\n  host: app1.example.com\n");

    // One connection for the whole run, lease released afterwards
    assert_eq!(fx.dialer.dial_count(), 1);
    assert!(fx.sessions.is_empty().await);

    let stored = fx.orchestrator.get_application(&app.id).await.unwrap();
    assert_eq!(stored.status, ApplicationStatus::Running);
}

#[tokio::test]
async fn test_first_app_on_domain_provisions_dns_and_tls() {
    let fx = Fixture::new().await;

    fx.orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();

    assert_eq!(
        fx.dns.upserted_names(),
        vec!["example.com", "*.example.com", "www.example.com"]
    );
    assert!(fx.dns.upserts().iter().all(|(_, ip)| ip == VPS_IP));
    assert_eq!(fx.issuer.issued(), 1);

    assert_eq!(fx.dialer.commands_matching("/etc/kubedeck/tls/example.com/tls.crt").len(), 2);
    assert_eq!(
        fx.dialer
            .commands_matching("kubectl create secret tls example-com-tls -n kube-system")
            .len(),
        1
    );
    assert_eq!(fx.dialer.commands_matching("rollout restart deployment traefik").len(), 1);

    let marker = keys::vps_ssl_marker(VPS_IP, "example.com");
    assert!(fx.kv.get(&marker).await.unwrap().is_some());
    assert!(fx
        .kv
        .get(&keys::domain_ssl_config("example.com"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_later_app_on_domain_adds_only_its_host() {
    let fx = Fixture::new().await;

    fx.orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();
    fx.orchestrator
        .create_application(request("code-server", "app2"), &token())
        .await
        .unwrap();

    let names = fx.dns.upserted_names();
    assert_eq!(names.len(), 4);
    assert_eq!(names[3], "app2.example.com");
    assert_eq!(fx.issuer.issued(), 1);
    assert_eq!(fx.dialer.commands_matching("kubectl create secret tls").len(), 1);
}

#[tokio::test]
async fn test_helm_repo_chart_with_pinned_version() {
    let fx = Fixture::new().await;

    let app = fx
        .orchestrator
        .create_application(request("grafana", "dash"), &token())
        .await
        .unwrap();

    assert_eq!(app.namespace, "monitoring");
    assert_eq!(app.release_name, "grafana-dash");
    assert_eq!(
        fx.dialer
            .commands_matching("helm repo add grafana https://grafana.github.io/helm-charts --force-update")
            .len(),
        1
    );
    let install = &fx.dialer.commands_matching("helm install")[0];
    assert!(install.contains("helm install grafana-dash grafana/grafana --namespace monitoring"));
    assert!(install.contains("--version 7.3.0"));
    assert!(fx.dialer.commands_matching("git clone").is_empty());
}

#[tokio::test]
async fn test_app_without_dns_skips_dns_and_tls() {
    let fx = Fixture::new().await;

    let app = fx
        .orchestrator
        .create_application(request("queue-worker", "jobs"), &token())
        .await
        .unwrap();

    assert_eq!(app.status, ApplicationStatus::Running);
    assert!(fx.dns.upserts().is_empty());
    assert_eq!(fx.issuer.issued(), 0);
    assert!(fx.dialer.commands_matching("kubectl get secret").is_empty());
}

#[tokio::test]
async fn test_generated_credential_is_stored_encrypted() {
    let fx = Fixture::new().await;
    // base64("s3cret")
    fx.dialer.respond("kubectl get secret", 0, "czNjcmV0\n");

    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();

    assert_eq!(
        fx.dialer
            .commands_matching("kubectl get secret code-server-app1 -n code-server")
            .len(),
        1
    );
    let sealed = fx.kv.get(&keys::app_password(&app.id)).await.unwrap().unwrap();
    assert_ne!(sealed, "s3cret");
    assert_eq!(
        secrets::decrypt(&sealed, &secrets::derive_key(&token())).unwrap(),
        "s3cret"
    );
}

#[tokio::test]
async fn test_credential_failure_does_not_fail_deployment() {
    let fx = Fixture::new().await;
    fx.dialer.respond("kubectl get secret", 1, "Error from server (NotFound)");

    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();

    assert_eq!(app.status, ApplicationStatus::Running);
    assert!(fx.kv.get(&keys::app_password(&app.id)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_install_marks_application_failed() {
    let fx = Fixture::new().await;
    fx.dialer.respond("helm install", 1, "Error: INSTALLATION FAILED: timed out waiting for the condition");

    let err = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CommandFailed { exit_code: 1, .. }));

    let apps = fx.orchestrator.list_applications(Some(VPS_ID)).await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].status, ApplicationStatus::Failed);

    // Fail-fast: nothing after the install ran
    assert!(fx.dns.upserts().is_empty());
    assert_eq!(fx.issuer.issued(), 0);
}

#[tokio::test]
async fn test_retry_after_failure() {
    let fx = Fixture::new().await;
    fx.dialer.respond("helm install", 1, "Error: INSTALLATION FAILED");

    fx.orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap_err();
    let id = fx.orchestrator.list_applications(None).await.unwrap()[0].id.clone();

    fx.dialer.respond("helm install", 0, "");
    let app = fx.orchestrator.retry_application(&id, &token()).await.unwrap();

    assert_eq!(app.status, ApplicationStatus::Running);
    assert_eq!(
        fx.dialer
            .commands_matching("helm uninstall code-server-app1 --namespace code-server")
            .len(),
        1
    );
    assert_eq!(fx.dialer.commands_matching("helm install").len(), 2);
}

#[tokio::test]
async fn test_retry_requires_failed_application() {
    let fx = Fixture::new().await;
    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();

    let err = fx.orchestrator.retry_application(&app.id, &token()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));
    assert_eq!(
        fx.orchestrator.get_application(&app.id).await.unwrap().status,
        ApplicationStatus::Running
    );
}

#[tokio::test]
async fn test_create_validation() {
    let fx = Fixture::new().await;

    let mut no_domain = request("code-server", "app1");
    no_domain.domain = "  ".to_string();
    assert!(matches!(
        fx.orchestrator.create_application(no_domain, &token()).await,
        Err(EngineError::ValidationError(_))
    ));

    let err = fx
        .orchestrator
        .create_application(request("unknown-app", "x"), &token())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    assert!(fx.orchestrator.list_applications(None).await.unwrap().is_empty());
    assert_eq!(fx.dialer.dial_count(), 0);
}

#[tokio::test]
async fn test_missing_ssh_key_fails_deployment() {
    let fx = Fixture::new().await;
    fx.kv.delete(keys::SSH_PRIVATE_KEY).await.unwrap();

    let err = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConfigError(_)));

    let apps = fx.orchestrator.list_applications(None).await.unwrap();
    assert_eq!(apps[0].status, ApplicationStatus::Failed);
}

#[tokio::test]
async fn test_explicit_version_is_used() {
    let fx = Fixture::new().await;
    let mut req = request("code-server", "app1");
    req.version = Some("4.8.3".to_string());

    let app = fx.orchestrator.create_application(req, &token()).await.unwrap();
    assert_eq!(app.version, "4.8.3");
    assert!(fx.dialer.inputs().iter().any(|(_, input)| input.contains("tag: 4.8.3")));
}

#[tokio::test]
async fn test_missing_version_is_fetched_and_cached() {
    let fx = Fixture::new().await;
    fx.upstream.publish("code-server", "4.23.1");

    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();
    assert_eq!(app.version, "4.23.1");
    assert_eq!(fx.version_cache.get("code-server").as_deref(), Some("4.23.1"));

    fx.orchestrator
        .create_application(request("code-server", "app2"), &token())
        .await
        .unwrap();
    assert_eq!(fx.upstream.calls(), 1);
}

#[tokio::test]
async fn test_cached_version_skips_upstream() {
    let fx = Fixture::new().await;
    fx.version_cache.insert("grafana", "11.0.0".to_string());

    let app = fx
        .orchestrator
        .create_application(request("grafana", "metrics"), &token())
        .await
        .unwrap();
    assert_eq!(app.version, "11.0.0");
    assert_eq!(fx.upstream.calls(), 0);
}

#[tokio::test]
async fn test_pinned_version_when_upstream_has_none() {
    let fx = Fixture::new().await;

    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();
    assert_eq!(app.version, "4.9.0");
    assert!(fx.version_cache.get("code-server").is_none());
}

#[tokio::test]
async fn test_upgrade() {
    let fx = Fixture::new().await;
    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();

    let upgraded = fx
        .orchestrator
        .upgrade_application(&app.id, "4.10.0", &token())
        .await
        .unwrap();

    assert_eq!(upgraded.status, ApplicationStatus::Running);
    assert_eq!(upgraded.version, "4.10.0");
    let upgrades = fx.dialer.commands_matching("helm upgrade");
    assert_eq!(upgrades.len(), 1);
    assert!(upgrades[0].contains("helm upgrade code-server-app1"));
    // No namespace, DNS or TLS work on upgrade
    assert_eq!(fx.dialer.commands_matching("kubectl create namespace").len(), 1);
    assert_eq!(fx.dns.upserts().len(), 3);
}

#[tokio::test]
async fn test_failed_upgrade_marks_application_failed() {
    let fx = Fixture::new().await;
    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();
    fx.dialer.respond("helm upgrade", 1, "Error: UPGRADE FAILED");

    assert!(fx
        .orchestrator
        .upgrade_application(&app.id, "4.10.0", &token())
        .await
        .is_err());
    assert_eq!(
        fx.orchestrator.get_application(&app.id).await.unwrap().status,
        ApplicationStatus::Failed
    );

    // A failed application can be upgraded again
    fx.dialer.respond("helm upgrade", 0, "");
    let app = fx
        .orchestrator
        .upgrade_application(&app.id, "4.10.1", &token())
        .await
        .unwrap();
    assert_eq!(app.status, ApplicationStatus::Running);
}

#[tokio::test]
async fn test_upgrade_requires_version() {
    let fx = Fixture::new().await;
    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();

    assert!(matches!(
        fx.orchestrator.upgrade_application(&app.id, " ", &token()).await,
        Err(EngineError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_real_time_status_is_not_persisted() {
    let fx = Fixture::new().await;
    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();

    fx.dialer
        .respond("helm status", 0, r#"{"name":"code-server-app1","info":{"status":"failed"}}"#);
    let status = fx.orchestrator.real_time_status(&app.id, &token()).await.unwrap();
    assert_eq!(status, ReleaseStatus::Mapped(ApplicationStatus::Failed));

    fx.dialer.respond("helm status", 1, "Error: release: not found");
    let status = fx.orchestrator.real_time_status(&app.id, &token()).await.unwrap();
    assert_eq!(status, ReleaseStatus::Mapped(ApplicationStatus::NotDeployed));

    fx.dialer
        .respond("helm status", 0, r#"{"info":{"status":"superseded"}}"#);
    let status = fx.orchestrator.real_time_status(&app.id, &token()).await.unwrap();
    assert_eq!(status, ReleaseStatus::Other("superseded".to_string()));

    assert_eq!(
        fx.orchestrator.get_application(&app.id).await.unwrap().status,
        ApplicationStatus::Running
    );
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let fx = Fixture::new().await;
    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();
    fx.kv.put(&keys::app_password(&app.id), "sealed".to_string()).await.unwrap();

    fx.orchestrator.delete_application(&app.id, &token()).await.unwrap();

    assert!(fx.orchestrator.get_application(&app.id).await.unwrap_err().is_not_found());
    assert!(fx.kv.get(&keys::app_password(&app.id)).await.unwrap().is_none());
    assert_eq!(
        fx.dialer
            .commands_matching("helm uninstall code-server-app1 --namespace code-server")
            .len(),
        1
    );
    assert_eq!(fx.dns.deletes(), vec!["app1.example.com"]);

    fx.orchestrator.delete_application(&app.id, &token()).await.unwrap();
    fx.orchestrator.delete_application("never-existed", &token()).await.unwrap();
    assert_eq!(fx.dialer.commands_matching("helm uninstall").len(), 1);
}

#[tokio::test]
async fn test_delete_survives_remote_failures() {
    let fx = Fixture::new().await;
    let app = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();
    fx.dialer.respond("helm uninstall", 1, "Error: uninstall: Release not loaded");
    fx.dns.fail_deletes(true);

    fx.orchestrator.delete_application(&app.id, &token()).await.unwrap();
    assert!(fx.kv.get(&keys::app(&app.id)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_waits_for_in_flight_create() {
    let fx = Fixture::new().await;

    let snapshot = fx
        .orchestrator
        .submit_create(request("code-server", "app1"), &token())
        .await
        .unwrap();
    assert_eq!(snapshot.status, ApplicationStatus::Creating);

    fx.orchestrator.delete_application(&snapshot.id, &token()).await.unwrap();
    fx.orchestrator.shutdown().await;

    let commands = fx.dialer.commands();
    let install = commands.iter().position(|c| c.contains("helm install")).unwrap();
    let uninstall = commands.iter().position(|c| c.contains("helm uninstall")).unwrap();
    assert!(install < uninstall);
    assert!(fx.orchestrator.get_application(&snapshot.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_submit_create_runs_in_background() {
    let fx = Fixture::new().await;

    let snapshot = fx
        .orchestrator
        .submit_create(request("code-server", "app1"), &token())
        .await
        .unwrap();
    fx.orchestrator.shutdown().await;

    let app = fx.orchestrator.get_application(&snapshot.id).await.unwrap();
    assert_eq!(app.status, ApplicationStatus::Running);
}

#[tokio::test]
async fn test_list_applications_filters_by_vps() {
    let fx = Fixture::new().await;
    let first = fx
        .orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();
    fx.orchestrator
        .create_application(request("queue-worker", "jobs"), &token())
        .await
        .unwrap();
    fx.kv.put("app:garbage", "{not json".to_string()).await.unwrap();

    let apps = fx.orchestrator.list_applications(Some(VPS_ID)).await.unwrap();
    assert_eq!(apps.len(), 2);
    assert_eq!(apps[0].id, first.id);
    assert!(fx.orchestrator.list_applications(Some("7")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_teardown_removes_all_records() {
    let fx = Fixture::new().await;
    fx.orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();
    fx.orchestrator
        .create_application(request("code-server", "app2"), &token())
        .await
        .unwrap();
    let commands_before = fx.dialer.commands().len();

    let removed = fx.orchestrator.teardown_vps(VPS_ID).await.unwrap();

    assert_eq!(removed, 2);
    assert!(fx.orchestrator.list_applications(Some(VPS_ID)).await.unwrap().is_empty());
    assert!(fx
        .kv
        .get(&keys::vps_ssl_marker(VPS_IP, "example.com"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(fx.dns.deletes().len(), 2);
    // The server is going away, nothing runs on it
    assert_eq!(fx.dialer.commands().len(), commands_before);
}

#[tokio::test]
async fn test_teardown_reports_partial_failure() {
    let fx = Fixture::new().await;
    fx.orchestrator
        .create_application(request("code-server", "app1"), &token())
        .await
        .unwrap();
    fx.orchestrator
        .create_application(request("code-server", "app2"), &token())
        .await
        .unwrap();
    fx.dns.fail_deletes(true);

    match fx.orchestrator.teardown_vps(VPS_ID).await {
        Err(EngineError::PartialFailure(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(errors.iter().all(|e| e.contains("DNS cleanup failed")));
        }
        other => panic!("expected partial failure, got {:?}", other),
    }

    // Records are removed regardless
    assert!(fx.orchestrator.list_applications(Some(VPS_ID)).await.unwrap().is_empty());
}
