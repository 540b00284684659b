//! Deterministic release and namespace naming
//!
//! Names are pure functions of the application type, subdomain and ID so a
//! repeated run always targets the same release.

/// Helm's release name limit
const MAX_RELEASE_NAME_LEN: usize = 53;

/// Kubernetes' namespace (DNS label) limit
const MAX_NAMESPACE_LEN: usize = 63;

/// Lowercase, replace anything outside `[a-z0-9-]` with `-`, collapse runs of
/// `-` and trim them from both ends
pub fn sanitize_label(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

fn truncate_label(mut label: String, max: usize) -> String {
    if label.len() > max {
        label.truncate(max);
        while label.ends_with('-') {
            label.pop();
        }
    }
    label
}

/// Namespace for an application: the catalog's namespace if set, otherwise
/// the application type
pub fn derive_namespace(app_type: &str, chart_namespace: Option<&str>) -> String {
    let base = chart_namespace
        .filter(|ns| !ns.trim().is_empty())
        .unwrap_or(app_type);
    truncate_label(sanitize_label(base), MAX_NAMESPACE_LEN)
}

/// Release name: `<type>-<subdomain>`, or `<type>-<id>` when the application
/// has no subdomain
pub fn derive_release_name(app_type: &str, subdomain: &str, id: &str) -> String {
    let suffix = if subdomain.trim().is_empty() { id } else { subdomain };
    let name = sanitize_label(&format!("{}-{}", app_type, suffix));
    truncate_label(name, MAX_RELEASE_NAME_LEN)
}

/// Name of the cluster TLS secret for a domain
pub fn tls_secret_name(domain: &str) -> String {
    truncate_label(format!("{}-tls", sanitize_label(domain)), MAX_NAMESPACE_LEN)
}
