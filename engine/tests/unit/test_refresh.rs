//! Refresh pool tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use kubedeck::cache::version::VersionCache;
use kubedeck::errors::EngineError;
use kubedeck::gateways::catalog::StaticCatalog;
use kubedeck::versions::VersionSource;
use kubedeck::workers::refresh::{Options, Priority, RefreshPool};
use kubedeck::workers::scheduler;

use crate::common::{code_server_entry, grafana_entry, worker_entry};

type Outcome = (String, Result<String, EngineError>);

/// Source answering from a table, failing the first `failures` calls per app
struct ScriptedSource {
    versions: HashMap<String, String>,
    failures: usize,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedSource {
    fn new(versions: &[(&str, &str)], failures: usize) -> Self {
        Self {
            versions: versions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            failures,
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls(&self, app_id: &str) -> usize {
        self.calls.lock().unwrap().get(app_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl VersionSource for ScriptedSource {
    async fn latest_version(&self, app_id: &str) -> Result<String, EngineError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(app_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let version = self
            .versions
            .get(app_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no release source for {}", app_id)))?;
        if call <= self.failures {
            return Err(EngineError::GatewayError("502 Bad Gateway".to_string()));
        }
        Ok(version)
    }
}

/// Source that blocks every call until the gate opens, reporting each start
struct GatedSource {
    started: mpsc::UnboundedSender<String>,
    gate: Semaphore,
    calls: AtomicUsize,
}

#[async_trait]
impl VersionSource for GatedSource {
    async fn latest_version(&self, app_id: &str) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.send(app_id.to_string());
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok("1.0.0".to_string())
    }
}

fn gated() -> (Arc<GatedSource>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let source = Arc::new(GatedSource {
        started: tx,
        gate: Semaphore::new(0),
        calls: AtomicUsize::new(0),
    });
    (source, rx)
}

fn options(workers: usize, queue_size: usize) -> Options {
    Options {
        workers,
        queue_size,
        retry_attempts: 2,
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

fn cache() -> Arc<VersionCache> {
    Arc::new(VersionCache::new(Duration::from_secs(3600), 100))
}

/// Callback forwarding outcomes into a channel
fn forward(tx: &mpsc::UnboundedSender<Outcome>) -> impl FnOnce(String, Result<String, EngineError>) + Send + 'static {
    let tx = tx.clone();
    move |app_id, result| {
        let _ = tx.send((app_id, result));
    }
}

#[tokio::test]
async fn test_request_before_start_is_rejected_synchronously() {
    let pool = RefreshPool::new(options(2, 10), Arc::new(ScriptedSource::new(&[], 0)), cache());
    let (tx, mut rx) = mpsc::unbounded_channel();

    pool.queue_request("grafana", Priority::High, forward(&tx));

    let (app_id, result) = rx.try_recv().unwrap();
    assert_eq!(app_id, "grafana");
    assert!(matches!(result, Err(EngineError::PoolStopped)));
}

#[tokio::test]
async fn test_refresh_updates_cache() {
    let source = Arc::new(ScriptedSource::new(&[("grafana", "10.4.1")], 0));
    let cache = cache();
    let pool = RefreshPool::new(options(2, 10), source.clone(), cache.clone());
    pool.start().unwrap();
    assert!(pool.is_running());

    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.queue_request("grafana", Priority::Normal, forward(&tx));

    let (app_id, result) = rx.recv().await.unwrap();
    assert_eq!(app_id, "grafana");
    assert_eq!(result.unwrap(), "10.4.1");
    assert_eq!(cache.get("grafana").as_deref(), Some("10.4.1"));

    pool.stop().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let source = Arc::new(ScriptedSource::new(&[("grafana", "10.4.1")], 2));
    let pool = RefreshPool::new(options(1, 10), source.clone(), cache());
    pool.start().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.queue_request("grafana", Priority::Normal, forward(&tx));

    let (_, result) = rx.recv().await.unwrap();
    assert_eq!(result.unwrap(), "10.4.1");
    assert_eq!(source.calls("grafana"), 3);

    pool.stop().await;
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let source = Arc::new(ScriptedSource::new(&[("grafana", "10.4.1")], 10));
    let cache = cache();
    let pool = RefreshPool::new(options(1, 10), source.clone(), cache.clone());
    pool.start().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.queue_request("grafana", Priority::Normal, forward(&tx));

    let (_, result) = rx.recv().await.unwrap();
    assert!(matches!(result, Err(EngineError::GatewayError(_))));
    assert_eq!(source.calls("grafana"), 3);
    assert!(cache.get("grafana").is_none());

    pool.stop().await;
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let source = Arc::new(ScriptedSource::new(&[], 0));
    let pool = RefreshPool::new(options(1, 10), source.clone(), cache());
    pool.start().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.queue_request("unknown", Priority::Normal, forward(&tx));

    let (_, result) = rx.recv().await.unwrap();
    assert!(result.unwrap_err().is_not_found());
    assert_eq!(source.calls("unknown"), 1);

    pool.stop().await;
}

#[tokio::test]
async fn test_higher_priority_served_first() {
    let (source, mut started) = gated();
    let pool = RefreshPool::new(options(1, 10), source.clone(), cache());
    pool.start().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.queue_request("busy", Priority::Low, forward(&tx));
    assert_eq!(started.recv().await.unwrap(), "busy");

    pool.queue_request("low", Priority::Low, forward(&tx));
    pool.queue_request("normal", Priority::Normal, forward(&tx));
    pool.queue_request("high", Priority::High, forward(&tx));
    assert_eq!(pool.queued(), 3);

    source.gate.add_permits(100);
    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(rx.recv().await.unwrap().0);
    }
    assert_eq!(order, vec!["busy", "high", "normal", "low"]);

    pool.stop().await;
}

#[tokio::test]
async fn test_full_queue_rejects_without_blocking() {
    let (source, mut started) = gated();
    let pool = RefreshPool::new(options(1, 1), source.clone(), cache());
    pool.start().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.queue_request("busy", Priority::Normal, forward(&tx));
    started.recv().await.unwrap();

    pool.queue_request("queued", Priority::Normal, forward(&tx));
    pool.queue_request("rejected", Priority::High, forward(&tx));

    let (app_id, result) = rx.try_recv().unwrap();
    assert_eq!(app_id, "rejected");
    assert!(matches!(result, Err(EngineError::QueueFull)));

    source.gate.add_permits(100);
    pool.stop().await;
}

#[tokio::test]
async fn test_stop_fails_pending_requests() {
    let (source, mut started) = gated();
    let pool = RefreshPool::new(options(1, 10), source.clone(), cache());
    pool.start().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.queue_request("in-flight", Priority::Normal, forward(&tx));
    started.recv().await.unwrap();
    pool.queue_request("pending-1", Priority::Normal, forward(&tx));
    pool.queue_request("pending-2", Priority::Low, forward(&tx));

    pool.stop().await;
    assert!(!pool.is_running());

    let mut outcomes = Vec::new();
    while let Ok(outcome) = rx.try_recv() {
        outcomes.push(outcome);
    }
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .all(|(_, result)| matches!(result, Err(EngineError::PoolStopped))));
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    // Stopped for good
    pool.queue_request("late", Priority::High, forward(&tx));
    assert!(matches!(rx.try_recv().unwrap().1, Err(EngineError::PoolStopped)));
    assert!(matches!(pool.start(), Err(EngineError::PoolStopped)));
}

#[tokio::test]
async fn test_scheduler_enqueues_every_catalog_entry() {
    let catalog = StaticCatalog::new(vec![code_server_entry(), grafana_entry(), worker_entry()]);
    let source = Arc::new(ScriptedSource::new(
        &[("code-server", "4.10.0"), ("grafana", "10.4.2"), ("queue-worker", "1.3.0")],
        0,
    ));
    let cache = cache();
    let pool = RefreshPool::new(options(2, 10), source.clone(), cache.clone());
    pool.start().unwrap();

    assert_eq!(scheduler::enqueue_catalog(&catalog, &pool).await, 3);

    for _ in 0..200 {
        if cache.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(cache.get("grafana").as_deref(), Some("10.4.2"));
    assert_eq!(cache.get("queue-worker").as_deref(), Some("1.3.0"));
    assert_eq!(cache.len(), 3);

    pool.stop().await;
}
