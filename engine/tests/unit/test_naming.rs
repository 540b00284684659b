//! Naming tests

use kubedeck::deploy::naming::{derive_namespace, derive_release_name, sanitize_label, tls_secret_name};

#[test]
fn test_release_name_is_deterministic() {
    let a = derive_release_name("code-server", "app1", "a1b2c3d4");
    let b = derive_release_name("code-server", "app1", "ffffffff");
    assert_eq!(a, "code-server-app1");
    assert_eq!(a, b);
}

#[test]
fn test_release_name_without_subdomain_uses_id() {
    assert_eq!(derive_release_name("grafana", "", "a1b2c3d4"), "grafana-a1b2c3d4");
    assert_eq!(derive_release_name("grafana", "  ", "a1b2c3d4"), "grafana-a1b2c3d4");
}

#[test]
fn test_release_name_is_a_valid_label() {
    let name = derive_release_name("Code_Server", "My.Workspace", "x");
    assert_eq!(name, "code-server-my-workspace");

    let long = derive_release_name("code-server", &"very-long-subdomain-".repeat(5), "x");
    assert!(long.len() <= 53);
    assert!(!long.ends_with('-'));
    assert!(long.starts_with("code-server-very-long"));
}

#[test]
fn test_namespace() {
    assert_eq!(derive_namespace("code-server", None), "code-server");
    assert_eq!(derive_namespace("grafana", Some("monitoring")), "monitoring");
    assert_eq!(derive_namespace("grafana", Some("")), "grafana");
    assert!(derive_namespace(&"n".repeat(80), None).len() <= 63);
}

#[test]
fn test_tls_secret_name() {
    assert_eq!(tls_secret_name("example.com"), "example-com-tls");
    assert_eq!(tls_secret_name("My.Domain.io"), "my-domain-io-tls");
}

#[test]
fn test_sanitize_label_collapses_separators() {
    assert_eq!(sanitize_label("a__b..c"), "a-b-c");
    assert_eq!(sanitize_label("___"), "");
}
