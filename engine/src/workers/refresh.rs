//! Background version refresh
//!
//! A fixed set of workers drains one bounded priority queue. Each request asks
//! the version source for an application's latest version, stores it in the
//! version cache and hands the outcome to the request's callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::version::VersionCache;
use crate::errors::EngineError;
use crate::versions::VersionSource;

/// Called once with the application ID and the refresh outcome
pub type RefreshCallback = Box<dyn FnOnce(String, Result<String, EngineError>) + Send + 'static>;

/// Request priority. Higher priorities are always served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Refresh pool options
#[derive(Debug, Clone)]
pub struct Options {
    pub workers: usize,

    /// Maximum number of queued requests across all priorities
    pub queue_size: usize,

    /// Interval of the catalog-wide refresh scheduler
    pub refresh_interval: Duration,

    /// Extra attempts after a failed source call
    pub retry_attempts: u32,

    pub retry_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 100,
            refresh_interval: Duration::from_secs(6 * 60 * 60),
            retry_attempts: 2,
            retry_delay: Duration::from_secs(5),
        }
    }
}

struct Request {
    app_id: String,
    priority: Priority,
    callback: RefreshCallback,
    queued_at: Instant,
}

#[derive(Default)]
struct Levels {
    queues: [VecDeque<Request>; 3],
    closed: bool,
}

impl Levels {
    fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn pop(&mut self) -> Option<Request> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }
}

/// Bounded multi-consumer queue ordered by priority, FIFO within a priority
struct RequestQueue {
    levels: Mutex<Levels>,
    capacity: usize,
    notify: Notify,
}

impl RequestQueue {
    fn new(capacity: usize) -> Self {
        Self {
            levels: Mutex::new(Levels::default()),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue without waiting. A full or closed queue hands the request back.
    fn try_push(&self, request: Request) -> Result<(), (Request, EngineError)> {
        {
            let mut levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
            if levels.closed {
                return Err((request, EngineError::PoolStopped));
            }
            if levels.len() >= self.capacity {
                return Err((request, EngineError::QueueFull));
            }
            levels.queues[request.priority.index()].push_back(request);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next request. `None` once cancelled or closed and empty.
    async fn pop(&self, cancel: &CancellationToken) -> Option<Request> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(request) = levels.pop() {
                    return Some(request);
                }
                if levels.closed {
                    return None;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Refuse further requests and return whatever is still queued
    fn close(&self) -> Vec<Request> {
        let mut levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        levels.closed = true;
        let mut pending = Vec::with_capacity(levels.len());
        while let Some(request) = levels.pop() {
            pending.push(request);
        }
        drop(levels);
        self.notify.notify_waiters();
        pending
    }

    fn len(&self) -> usize {
        self.levels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct PoolState {
    started: bool,
    workers: Vec<JoinHandle<()>>,
}

/// Worker pool refreshing cached application versions
pub struct RefreshPool {
    options: Options,
    source: Arc<dyn VersionSource>,
    cache: Arc<VersionCache>,
    queue: Arc<RequestQueue>,
    accepting: AtomicBool,
    cancel: CancellationToken,
    state: Mutex<PoolState>,
}

impl RefreshPool {
    pub fn new(options: Options, source: Arc<dyn VersionSource>, cache: Arc<VersionCache>) -> Self {
        Self {
            queue: Arc::new(RequestQueue::new(options.queue_size.max(1))),
            options,
            source,
            cache,
            accepting: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            state: Mutex::new(PoolState {
                started: false,
                workers: Vec::new(),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Launch the workers. A stopped pool cannot be restarted.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.cancel.is_cancelled() {
            return Err(EngineError::PoolStopped);
        }
        if state.started {
            warn!("Refresh pool already started");
            return Ok(());
        }

        let count = self.options.workers.max(1);
        info!(
            "Starting refresh pool with {} workers (queue size {})",
            count, self.options.queue_size
        );
        for id in 0..count {
            let worker = Worker {
                id,
                queue: self.queue.clone(),
                source: self.source.clone(),
                cache: self.cache.clone(),
                retry_attempts: self.options.retry_attempts,
                retry_delay: self.options.retry_delay,
                cancel: self.cancel.clone(),
            };
            state.workers.push(tokio::spawn(worker.run()));
        }
        state.started = true;
        self.accepting.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the workers and fail every request still queued
    pub async fn stop(&self) {
        let workers = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut state.workers)
        };

        info!("Stopping refresh pool...");
        self.cancel.cancel();
        self.accepting.store(false, Ordering::SeqCst);

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!("Refresh worker panicked: {}", e);
            }
        }

        let pending = self.queue.close();
        if !pending.is_empty() {
            debug!("Failing {} queued refresh requests", pending.len());
        }
        for request in pending {
            (request.callback)(request.app_id, Err(EngineError::PoolStopped));
        }
        info!("Refresh pool stopped");
    }

    /// Queue a refresh without blocking.
    ///
    /// When the pool is not running or the queue is full, `callback` runs
    /// immediately on the caller's task with the error.
    pub fn queue_request<F>(&self, app_id: &str, priority: Priority, callback: F)
    where
        F: FnOnce(String, Result<String, EngineError>) + Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            callback(app_id.to_string(), Err(EngineError::PoolStopped));
            return;
        }

        let request = Request {
            app_id: app_id.to_string(),
            priority,
            callback: Box::new(callback),
            queued_at: Instant::now(),
        };
        if let Err((request, err)) = self.queue.try_push(request) {
            warn!("Refresh of {} rejected: {}", request.app_id, err);
            (request.callback)(request.app_id, Err(err));
        }
    }

    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Requests waiting for a worker
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

struct Worker {
    id: usize,
    queue: Arc<RequestQueue>,
    source: Arc<dyn VersionSource>,
    cache: Arc<VersionCache>,
    retry_attempts: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!("Refresh worker {} started", self.id);

        while let Some(request) = self.queue.pop(&self.cancel).await {
            let waited = request.queued_at.elapsed();
            let started = Instant::now();
            let result = self.fetch(&request.app_id).await;
            let took = started.elapsed();

            match &result {
                Ok(version) => {
                    self.cache.insert(&request.app_id, version.clone());
                    info!(
                        "Refreshed {} ({:?}): {} in {:?}, queued {:?}",
                        request.app_id, request.priority, version, took, waited
                    );
                }
                Err(e) => warn!(
                    "Refresh of {} ({:?}) failed in {:?}: {}",
                    request.app_id, request.priority, took, e
                ),
            }
            (request.callback)(request.app_id, result);
        }

        debug!("Refresh worker {} stopped", self.id);
    }

    /// Ask the source, retrying failures until attempts run out or the pool
    /// is cancelled
    async fn fetch(&self, app_id: &str) -> Result<String, EngineError> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::PoolStopped),
                result = self.source.latest_version(app_id) => result,
            };

            match result {
                Ok(version) => return Ok(version),
                Err(e) if e.is_not_found() || attempt >= self.retry_attempts => return Err(e),
                Err(e) => {
                    attempt += 1;
                    debug!(
                        "Refresh of {} failed ({}), retry {}/{} in {:?}",
                        app_id, e, attempt, self.retry_attempts, self.retry_delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }
}
