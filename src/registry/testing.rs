//! An in-memory [`Registry`] implementation used by this crate's own tests
//! and available to embedders for their own integration tests (enabled via
//! the `testing` feature, or always-on under `#[cfg(test)]`). Not a
//! deployment target: real backends (Consul, etcd, ...) stay external.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::watcher::{LongPollDriver, LongPollQuery};
use super::{ListenerId, NotifyListener, Registry, ServerInstance, Status};
use crate::error::TenuredError;

#[derive(Default)]
struct MockState {
    store: Mutex<HashMap<String, ServerInstance>>,
    index: AtomicU64,
    changed: Notify,
}

impl MockState {
    fn snapshot(&self, name: &str) -> Vec<ServerInstance> {
        self.store
            .lock()
            .values()
            .filter(|i| i.name == name)
            .cloned()
            .collect()
    }

    fn bump(&self) -> u64 {
        let next = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        self.changed.notify_waiters();
        next
    }
}

struct MockQuery(Arc<MockState>);

#[async_trait]
impl LongPollQuery for MockQuery {
    async fn poll(
        &self,
        name: &str,
        wait_index: u64,
        wait_time: Duration,
    ) -> Result<(Vec<ServerInstance>, u64), TenuredError> {
        let deadline = Instant::now() + wait_time;
        loop {
            let current = self.0.index.load(Ordering::SeqCst);
            if current != wait_index {
                return Ok((self.0.snapshot(name), current));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok((self.0.snapshot(name), wait_index));
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    return Ok((self.0.snapshot(name), wait_index));
                }
                _ = self.0.changed.notified() => { continue; }
            }
        }
    }
}

/// An in-memory registry: a good enough stand-in for Consul in tests of
/// everything layered on top of the [`Registry`] contract (caching overlay,
/// load-balance policies, long-poll deltas).
pub struct MockRegistry {
    state: Arc<MockState>,
    driver: LongPollDriver<MockQuery>,
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRegistry {
    pub fn new() -> Self {
        let state = Arc::new(MockState::default());
        let driver = LongPollDriver::new(Arc::new(MockQuery(state.clone())), Duration::from_millis(30));
        Self { state, driver }
    }

    /// Convenience for tests: register without going through the async
    /// `Registry` trait object indirection.
    pub async fn seed(&self, instance: ServerInstance) {
        self.register(instance).await.unwrap();
    }

    pub fn set_status(&self, id: &str, status: Status) {
        let mut store = self.state.store.lock();
        if let Some(instance) = store.get_mut(id) {
            instance.status = status;
        }
        drop(store);
        self.state.bump();
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn register(&self, instance: ServerInstance) -> Result<(), TenuredError> {
        self.state.store.lock().insert(instance.id.clone(), instance);
        self.state.bump();
        Ok(())
    }

    async fn unregister(&self, id: &str) -> Result<(), TenuredError> {
        self.state.store.lock().remove(id);
        self.state.bump();
        Ok(())
    }

    async fn lookup(&self, name: &str, tags: &[String]) -> Result<Vec<ServerInstance>, TenuredError> {
        Ok(self
            .state
            .snapshot(name)
            .into_iter()
            .filter(|i| i.matches_tags(tags))
            .collect())
    }

    async fn subscribe(
        &self,
        name: &str,
        listener_id: ListenerId,
        listener: NotifyListener,
    ) -> Result<(), TenuredError> {
        self.driver.subscribe(name, listener_id, listener);
        Ok(())
    }

    async fn unsubscribe(&self, name: &str, listener_id: ListenerId) -> Result<(), TenuredError> {
        self.driver.unsubscribe(name, listener_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_lookup_returns_the_instance() {
        let registry = MockRegistry::new();
        let instance = ServerInstance::new("1", "svc", "127.0.0.1:9000");
        registry.register(instance.clone()).await.unwrap();
        let found = registry.lookup("svc", &[]).await.unwrap();
        assert_eq!(found, vec![instance]);
    }

    #[tokio::test]
    async fn unsubscribe_then_notify_delivers_nothing() {
        let registry = MockRegistry::new();
        let id = ListenerId::new();
        let calls = Arc::new(Mutex::new(0));
        let calls2 = calls.clone();
        registry
            .subscribe("svc", id, Arc::new(move |_| *calls2.lock() += 1))
            .await
            .unwrap();
        registry.unsubscribe("svc", id).await.unwrap();
        registry.seed(ServerInstance::new("1", "svc", "h1")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*calls.lock(), 0);
    }
}
