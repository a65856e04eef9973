//! Named bounded worker pools command handlers run on (spec §4.4, §5).
//! Each [`Executor`] is a fixed number of worker tasks pulling from one
//! bounded queue; a full queue means "reply overloaded", never "block the
//! receiver".

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::TenuredError;

type BoxTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The default pool: 256 workers, a queue depth of 10 000 (spec §4.4).
pub const DEFAULT_WORKERS: usize = 256;
pub const DEFAULT_QUEUE: usize = 10_000;

/// A single named worker pool. Submitting past `queueCapacity` fails
/// immediately rather than blocking the caller.
pub struct Executor {
    name: String,
    // `None` once `drain` has run: dropping the sender is what lets every
    // worker's `rx.recv()` observe channel-closed and exit.
    tx: Mutex<Option<mpsc::Sender<BoxTask>>>,
    workers: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(name: impl Into<String>, workers: usize, queue: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<BoxTask>(queue.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let name = name.into();

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match task {
                        Some(task) => {
                            // Catch panics so one misbehaving handler never
                            // poisons the worker or takes down the pool
                            // (spec §9 "panic safety in handlers").
                            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                                tracing::error!("handler task panicked");
                            }
                        }
                        None => break,
                    }
                }
            }));
        }

        Arc::new(Self {
            name,
            tx: Mutex::new(Some(tx)),
            workers: AsyncMutex::new(handles),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `task`. Returns `Err(Overloaded)` without blocking if the
    /// queue is full, or `Err(Closed)` if this pool has already drained.
    pub fn try_submit<F>(&self, task: F) -> Result<(), TenuredError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(TenuredError::Closed)?;
        tx.try_send(Box::pin(task)).map_err(|_| TenuredError::Overloaded)
    }

    /// Stop accepting new work and wait for queued/in-flight tasks to
    /// finish. Dropping the sender is what unblocks every worker's
    /// `rx.recv()` once the queue drains.
    pub async fn drain(&self) {
        self.tx.lock().take();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Maps executor names to pools (spec §4.4). A default pool always exists;
/// `get` on an unregistered name falls back to it, matching
/// `executors.ExecutorManager` in the original Go source.
pub struct ExecutorManager {
    executors: DashMap<String, Arc<Executor>>,
    default: Arc<Executor>,
}

impl Default for ExecutorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorManager {
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
            default: Executor::new("default", DEFAULT_WORKERS, DEFAULT_QUEUE),
        }
    }

    /// Register (or replace) a named pool.
    pub fn register(&self, name: impl Into<String>, workers: usize, queue: usize) {
        let name = name.into();
        self.executors.insert(name.clone(), Executor::new(name, workers, queue));
    }

    /// Apply a `{name -> "workers,queue"}` configuration mapping, matching
    /// the original's `services.Executors` shape.
    pub fn configure(&self, config: &HashMap<String, String>) -> Result<(), String> {
        for (name, spec) in config {
            let (workers_str, queue_str) = spec
                .split_once(',')
                .ok_or_else(|| format!("executor {name}: expected \"workers,queue\", got {spec:?}"))?;
            let workers: usize = workers_str
                .trim()
                .parse()
                .map_err(|_| format!("executor {name}: invalid worker count {workers_str:?}"))?;
            let queue: usize = queue_str
                .trim()
                .parse()
                .map_err(|_| format!("executor {name}: invalid queue depth {queue_str:?}"))?;
            self.register(name.clone(), workers, queue);
        }
        Ok(())
    }

    /// Look up a named pool, falling back to the default pool.
    pub fn get(&self, name: &str) -> Arc<Executor> {
        self.executors
            .get(name)
            .map(|e| e.clone())
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn default_executor(&self) -> Arc<Executor> {
        self.default.clone()
    }

    /// Drain every managed pool, including the default.
    pub async fn shutdown(&self) {
        self.default.drain().await;
        for entry in self.executors.iter() {
            entry.value().drain().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_submitted_task() {
        let exec = Executor::new("t", 2, 8);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        exec.try_submit(async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        exec.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let exec = Executor::new("t", 1, 1);
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let gate_rx = Arc::new(AsyncMutex::new(Some(gate_rx)));
        // occupy the single worker
        let gate_rx2 = gate_rx.clone();
        exec.try_submit(async move {
            let rx = gate_rx2.lock().await.take().unwrap();
            let _ = rx.await;
        })
        .unwrap();
        // let the worker actually dequeue and block on the gate before
        // filling the queue behind it
        tokio::task::yield_now().await;
        // fill the depth-1 queue
        exec.try_submit(async {}).unwrap();
        // now it's full
        assert!(matches!(exec.try_submit(async {}), Err(TenuredError::Overloaded)));
        let _ = gate_tx.send(());
        exec.drain().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_pool() {
        let exec = Executor::new("t", 1, 4);
        exec.try_submit(async { panic!("boom") }).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        exec.try_submit(async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        exec.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn configure_parses_workers_and_queue() {
        let manager = ExecutorManager::new();
        let mut cfg = HashMap::new();
        cfg.insert("snowflake".to_string(), "10,1000".to_string());
        manager.configure(&cfg).unwrap();
        assert_eq!(manager.get("snowflake").name(), "snowflake");
    }

    #[tokio::test]
    async fn unregistered_name_falls_back_to_default() {
        let manager = ExecutorManager::new();
        assert_eq!(manager.get("nope").name(), "default");
    }
}
