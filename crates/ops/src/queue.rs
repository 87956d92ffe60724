//! Deduplicating work queue feeding operation ids to a pool of workers.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Processes one queued id. `Ok(d)` with a non-zero `d` asks for another run after `d`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, id: &str) -> Result<Duration>;
}

#[derive(Default)]
struct Items {
    queue: VecDeque<String>,
    /// Ids waiting to be processed.
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
}

pub struct WorkQueue {
    name: String,
    executor: Arc<dyn Executor>,
    items: Mutex<Items>,
    notify: Notify,
    last_run: Mutex<FxHashMap<String, Instant>>,
    warn_after: Duration,
    health_interval: Duration,
    speed_factor: u32,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>, warn_after: Duration, health_interval: Duration) -> Self {
        Self {
            name: name.into(),
            executor,
            items: Mutex::new(Items::default()),
            notify: Notify::new(),
            last_run: Mutex::new(FxHashMap::default()),
            warn_after,
            health_interval,
            speed_factor: 1,
        }
    }

    /// Divide requeue delays by `factor`. Tests only.
    pub fn speed_up(mut self, factor: u32) -> Self {
        self.speed_factor = factor.max(1);
        self
    }

    fn items(&self) -> MutexGuard<'_, Items> { self.items.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn len(&self) -> usize { self.items().queue.len() }

    pub fn is_empty(&self) -> bool { self.items().queue.is_empty() }

    /// Enqueue `id` unless it is already waiting. An id being processed is queued again once it is done.
    pub fn add(&self, id: &str) {
        let len = {
            let mut it = self.items();
            if !it.dirty.insert(id.to_string()) {
                return;
            }
            if !it.processing.contains(id) {
                it.queue.push_back(id.to_string());
            }
            it.queue.len()
        };
        self.notify.notify_one();
        info!(queue = %self.name, operation = %id, len, "added item to the queue");
    }

    pub fn add_after(self: &Arc<Self>, id: &str, delay: Duration) {
        if delay.is_zero() {
            return self.add(id);
        }
        debug!(queue = %self.name, operation = %id, after = ?delay, "item will be added to the queue");
        let q = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(&id);
        });
    }

    async fn get(&self) -> String {
        loop {
            {
                let mut it = self.items();
                if let Some(id) = it.queue.pop_front() {
                    it.dirty.remove(&id);
                    it.processing.insert(id.clone());
                    if !it.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return id;
                }
            }
            self.notify.notified().await;
        }
    }

    fn done(&self, id: &str) {
        let requeue = {
            let mut it = self.items();
            it.processing.remove(id);
            let again = it.dirty.contains(id);
            if again {
                it.queue.push_back(id.to_string());
            }
            again
        };
        if requeue {
            self.notify.notify_one();
        }
    }

    fn touch(&self, worker: &str) {
        let now = Instant::now();
        let mut runs = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = runs.insert(worker.to_string(), now) {
            debug!(worker, since_last = ?now.duration_since(prev), "worker execution");
        }
    }

    /// Process one id on behalf of `worker`; a panicking executor is contained.
    pub async fn process(self: &Arc<Self>, worker: &str, id: String) {
        self.touch(worker);
        info!(worker, operation = %id, len = self.len(), "about to process item");
        match AssertUnwindSafe(self.executor.execute(&id)).catch_unwind().await {
            Ok(Ok(when)) if !when.is_zero() => {
                let after = when / self.speed_factor;
                info!(operation = %id, after = ?after, "adding item after delay");
                self.add_after(&id, after);
            }
            Ok(Ok(_)) => info!(operation = %id, "item has been processed, no retry, element forgotten"),
            Ok(Err(e)) => error!(operation = %id, error = %format!("{e:#}"), "error from process"),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                let stack = std::backtrace::Backtrace::force_capture();
                error!(operation = %id, panic = %msg, stack = %stack, "panic error from process");
            }
        }
        self.done(&id);
    }

    /// Log per-worker activity; returns the workers idle for longer than the warning threshold.
    pub fn log_workers_summary(&self) -> Vec<String> {
        let runs = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        info!(queue = %self.name, len = self.len(), workers = runs.len(), "health summary");
        let mut stale = Vec::new();
        for (worker, last) in runs.iter() {
            let idle = last.elapsed();
            if idle > self.warn_after {
                warn!(queue = %self.name, worker = %worker, idle = ?idle, limit = ?self.warn_after, "worker exceeded allowed time since last execution");
                stale.push(worker.clone());
            } else {
                debug!(queue = %self.name, worker = %worker, idle = ?idle, "worker last execution");
            }
        }
        stale.sort();
        stale
    }

    /// Start `workers` workers and the health logger. In-flight items finish after cancellation.
    pub fn run(self: &Arc<Self>, workers: usize, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(queue = %self.name, workers, len = self.len(), "starting workers");
        let mut handles = Vec::with_capacity(workers + 1);
        for i in 0..workers {
            let q = Arc::clone(self);
            let cancel = cancel.clone();
            let worker = format!("{}-{i}", self.name);
            let span = info_span!("worker", component = "operations-queue", worker = %worker);
            handles.push(tokio::spawn(
                async move {
                    debug!("worker starting");
                    loop {
                        let id = tokio::select! {
                            _ = cancel.cancelled() => break,
                            id = q.get() => id,
                        };
                        q.process(&worker, id).await;
                    }
                    debug!("worker done");
                }
                .instrument(span),
            ));
        }
        let q = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(q.health_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => { q.log_workers_summary(); }
                }
            }
        }));
        handles
    }
}
