//! Version cache unit tests

use std::sync::Arc;
use std::time::Duration;

use kubedeck::cache::version::VersionCache;
use kubedeck::versions::{CachedVersionSource, VersionSource};

use crate::common::ScriptedVersions;

#[test]
fn test_cache_insert_and_get() {
    let cache = VersionCache::new(Duration::from_secs(3600), 10);
    assert!(cache.is_empty());

    cache.insert("grafana", "10.4.1".to_string());
    assert_eq!(cache.get("grafana").as_deref(), Some("10.4.1"));
    assert_eq!(cache.get("n8n"), None);

    cache.insert("grafana", "10.4.2".to_string());
    assert_eq!(cache.get("grafana").as_deref(), Some("10.4.2"));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_cache_remove() {
    let cache = VersionCache::new(Duration::from_secs(3600), 10);
    cache.insert("grafana", "10.4.1".to_string());

    let removed = cache.remove("grafana").unwrap();
    assert_eq!(removed.version, "10.4.1");
    assert!(cache.get("grafana").is_none());
    assert!(cache.remove("grafana").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_read_through_refetches_after_expiry() {
    let cache = Arc::new(VersionCache::new(Duration::from_secs(60), 10));
    let upstream = Arc::new(ScriptedVersions::default());
    upstream.publish("code-server", "4.10.0");
    let source = CachedVersionSource::new(cache.clone(), upstream.clone());

    assert_eq!(source.latest_version("code-server").await.unwrap(), "4.10.0");

    // A newer release stays hidden until the entry expires
    upstream.publish("code-server", "4.11.0");
    assert_eq!(source.latest_version("code-server").await.unwrap(), "4.10.0");
    assert_eq!(upstream.calls(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(source.latest_version("code-server").await.unwrap(), "4.11.0");
    assert_eq!(upstream.calls(), 2);
    assert_eq!(cache.get("code-server").as_deref(), Some("4.11.0"));
}
