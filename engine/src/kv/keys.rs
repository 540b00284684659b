//! Key shapes used in the key-value store

/// Prefix shared by all application records
pub const APP_PREFIX: &str = "app:";

/// Shared certificate signing request template
pub const SSL_CSR: &str = "config:ssl:csr";

/// Shared SSH private key (PEM) used to reach every VPS
pub const SSH_PRIVATE_KEY: &str = "config:ssh:private_key";

/// `app:<id>`
pub fn app(id: &str) -> String {
    format!("{}{}", APP_PREFIX, id)
}

/// `app:<id>:password`
pub fn app_password(id: &str) -> String {
    format!("{}{}:password", APP_PREFIX, id)
}

/// `vps:<id>:config`
pub fn vps_config(vps_id: &str) -> String {
    format!("vps:{}:config", vps_id)
}

/// `domain:<domain>:ssl_config`
pub fn domain_ssl_config(domain: &str) -> String {
    format!("domain:{}:ssl_config", domain)
}

/// `vps:<ip>:ssl:<domain>`, the "TLS configured" marker
pub fn vps_ssl_marker(public_ip: &str, domain: &str) -> String {
    format!("vps:{}:ssl:{}", public_ip, domain)
}

/// Extract the application ID from an `app:<id>` record key.
///
/// Returns `None` for sub-keys such as `app:<id>:password`.
pub fn app_id_from_key(key: &str) -> Option<&str> {
    let id = key.strip_prefix(APP_PREFIX)?;
    if id.is_empty() || id.contains(':') {
        return None;
    }
    Some(id)
}
