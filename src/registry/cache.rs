//! Caching overlay over a [`Registry`] (spec §4.5 "Caching overlay"):
//! eliminates redundant lookups and fans out notifications into its own
//! view, which callers can use for cheap repeated reads between
//! subscription updates.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ListenerId, NotifyListener, Registry, ServerInstance, Status};
use crate::error::TenuredError;

/// Wraps a `Registry` delegate, populating `by_name` on first `lookup` and
/// refreshing it only through subscription deltas thereafter (spec §3
/// RegistryCache, §4.5).
pub struct CachingRegistry<R: Registry> {
    delegate: Arc<R>,
    by_name: Arc<DashMap<String, Vec<ServerInstance>>>,
    /// Tracks which `(name, listener_id)` pairs are currently subscribed, so
    /// re-subscribing the same pair is a no-op (spec §4.5 idempotence).
    listener_index: Mutex<HashSet<(String, ListenerId)>>,
}

impl<R: Registry + 'static> CachingRegistry<R> {
    pub fn new(delegate: Arc<R>) -> Self {
        Self {
            delegate,
            by_name: Arc::new(DashMap::new()),
            listener_index: Mutex::new(HashSet::new()),
        }
    }

    fn apply_deltas(by_name: &DashMap<String, Vec<ServerInstance>>, deltas: &[ServerInstance]) {
        for delta in deltas {
            let mut entry = by_name.entry(delta.name.clone()).or_default();
            if delta.status == Status::Down {
                entry.retain(|existing| existing.id != delta.id);
                continue;
            }
            match entry.iter_mut().find(|existing| existing.id == delta.id) {
                Some(existing) => *existing = delta.clone(),
                None => entry.push(delta.clone()),
            }
        }
    }
}

#[async_trait]
impl<R: Registry + 'static> Registry for CachingRegistry<R> {
    async fn register(&self, instance: ServerInstance) -> Result<(), TenuredError> {
        self.delegate.register(instance).await
    }

    async fn unregister(&self, id: &str) -> Result<(), TenuredError> {
        self.delegate.unregister(id).await
    }

    async fn lookup(&self, name: &str, tags: &[String]) -> Result<Vec<ServerInstance>, TenuredError> {
        if let Some(cached) = self.by_name.get(name) {
            return Ok(cached.iter().filter(|i| i.matches_tags(tags)).cloned().collect());
        }
        let fetched = self.delegate.lookup(name, &[]).await?;
        self.by_name.insert(name.to_string(), fetched.clone());
        Ok(fetched.into_iter().filter(|i| i.matches_tags(tags)).collect())
    }

    async fn subscribe(
        &self,
        name: &str,
        listener_id: ListenerId,
        listener: NotifyListener,
    ) -> Result<(), TenuredError> {
        let key = (name.to_string(), listener_id);
        {
            let mut index = self.listener_index.lock();
            if index.contains(&key) {
                return Ok(()); // idempotent re-subscribe (spec §4.5)
            }
            index.insert(key);
        }

        let by_name = self.by_name.clone();
        let wrapped: NotifyListener = Arc::new(move |deltas: &[ServerInstance]| {
            listener(deltas);
            CachingRegistry::<R>::apply_deltas(&by_name, deltas);
        });
        self.delegate.subscribe(name, listener_id, wrapped).await
    }

    async fn unsubscribe(&self, name: &str, listener_id: ListenerId) -> Result<(), TenuredError> {
        self.listener_index.lock().remove(&(name.to_string(), listener_id));
        self.delegate.unsubscribe(name, listener_id).await
    }
}
