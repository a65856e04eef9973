//! Generic long-poll diffing harness (spec §4.5 "Long-poll watcher (driver
//! side)"). Not a concrete backend — a concrete driver (e.g. Consul) plugs
//! its blocking query into [`LongPollQuery`] and gets delta computation,
//! backoff-on-error, and listener fan-out for free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{ListenerId, NotifyListener, ServerInstance, Status};
use crate::error::TenuredError;

/// A blocking query against an underlying registry provider: given the
/// last-seen `wait_index`, block up to `wait_time` and return the current
/// entry set plus the new index. Returning the same `last_index` signals
/// "no change within waitTime" (spec §6).
#[async_trait]
pub trait LongPollQuery: Send + Sync {
    async fn poll(
        &self,
        name: &str,
        wait_index: u64,
        wait_time: Duration,
    ) -> Result<(Vec<ServerInstance>, u64), TenuredError>;
}

const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Per-service-name subscription bookkeeping: listeners are keyed by their
/// [`ListenerId`] so unsubscribe can remove exactly one; the watcher tears
/// down once the last listener leaves (spec §3 Subscription invariants).
struct Subscription {
    listeners: Mutex<HashMap<ListenerId, NotifyListener>>,
    stop: Arc<Notify>,
}

/// Manages one long-poll watcher task per subscribed name, generic over
/// whatever query function a concrete driver supplies.
pub struct LongPollDriver<Q: LongPollQuery + 'static> {
    query: Arc<Q>,
    wait_time: Duration,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
}

impl<Q: LongPollQuery + 'static> LongPollDriver<Q> {
    pub fn new(query: Arc<Q>, wait_time: Duration) -> Self {
        Self {
            query,
            wait_time,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Add `listener` under `listener_id` for `name`. A second call with the
    /// same id is a no-op (spec §4.5 idempotence). Spawns the watcher task
    /// the first time `name` gets a listener.
    pub fn subscribe(&self, name: &str, listener_id: ListenerId, listener: NotifyListener) {
        let mut subs = self.subscriptions.lock();
        let is_new_name = !subs.contains_key(name);
        let sub = subs
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Subscription {
                    listeners: Mutex::new(HashMap::new()),
                    stop: Arc::new(Notify::new()),
                })
            })
            .clone();
        drop(subs);

        let mut listeners = sub.listeners.lock();
        if listeners.contains_key(&listener_id) {
            return;
        }
        listeners.insert(listener_id, listener);
        drop(listeners);

        if is_new_name {
            let query = self.query.clone();
            let wait_time = self.wait_time;
            let sub_for_task = sub.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                run_long_poll(name, query, sub_for_task, wait_time).await;
            });
        }
    }

    /// Remove `listener_id` from `name`'s subscription. Tears the watcher
    /// down once the last listener is gone.
    pub fn unsubscribe(&self, name: &str, listener_id: ListenerId) {
        let mut subs = self.subscriptions.lock();
        let Some(sub) = subs.get(name).cloned() else {
            return;
        };
        let mut listeners = sub.listeners.lock();
        listeners.remove(&listener_id);
        let now_empty = listeners.is_empty();
        drop(listeners);
        if now_empty {
            subs.remove(name);
            sub.stop.notify_one();
        }
    }
}

async fn run_long_poll<Q: LongPollQuery + 'static>(
    name: String,
    query: Arc<Q>,
    sub: Arc<Subscription>,
    wait_time: Duration,
) {
    let mut wait_index: u64 = 0;
    let mut view: HashMap<String, ServerInstance> = HashMap::new();

    loop {
        let poll = query.poll(&name, wait_index, wait_time);
        let outcome = tokio::select! {
            _ = sub.stop.notified() => return,
            outcome = poll => outcome,
        };

        let (entries, last_index) = match outcome {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "registry long-poll failed, retrying after backoff");
                tokio::select! {
                    _ = sub.stop.notified() => return,
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                }
                continue;
            }
        };

        if last_index == wait_index {
            continue;
        }

        let mut notifies = Vec::new();
        let mut current: HashMap<String, ServerInstance> = HashMap::with_capacity(entries.len());
        for instance in entries {
            let changed = match view.get(&instance.id) {
                Some(old) => old.status != instance.status,
                None => true,
            };
            if changed {
                notifies.push(instance.clone());
            }
            current.insert(instance.id.clone(), instance);
        }
        for (id, old) in view.iter() {
            if !current.contains_key(id) {
                let mut gone = old.clone();
                gone.status = Status::Down;
                notifies.push(gone);
            }
        }

        if !notifies.is_empty() {
            // Snapshot listeners, then call them with the lock released:
            // never hold a lock across a listener invocation (spec §5).
            let callbacks: Vec<NotifyListener> = sub.listeners.lock().values().cloned().collect();
            for callback in &callbacks {
                callback(&notifies);
            }
        }

        view = current;
        wait_index = last_index;
    }
}
