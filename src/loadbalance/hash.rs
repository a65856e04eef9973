//! Consistent-hash policy: a ring with 100 virtual nodes per instance,
//! rebuilt on every registry update (spec §4.6 HashLoadBalance). The ring
//! is sorted by hash; `select` walks to the first entry at or past the
//! key's hash, wrapping to the start.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::{KeyExtractor, LoadBalance, Selection};
use crate::registry::ServerInstance;

pub(crate) const VIRTUAL_NODES: u32 = 100;

pub(crate) fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Builds a ring sorted by hash, breaking ties lexicographically by the
/// vnode key so the ordering is deterministic across rebuilds.
pub(crate) fn build_ring(instances: &[ServerInstance]) -> Vec<(u64, ServerInstance)> {
    let mut ring = Vec::with_capacity(instances.len() * VIRTUAL_NODES as usize);
    for instance in instances {
        for vnode in 0..VIRTUAL_NODES {
            let key = format!("{}#{}", instance.id, vnode);
            ring.push((hash_str(&key), instance.clone()));
        }
    }
    ring.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
    ring
}

/// First entry at or past `target`, wrapping to the start of the ring.
pub(crate) fn pick_from_ring(ring: &[(u64, ServerInstance)], target: u64) -> Option<ServerInstance> {
    if ring.is_empty() {
        return None;
    }
    match ring.binary_search_by(|(hash, _)| hash.cmp(&target)) {
        Ok(idx) => Some(ring[idx].1.clone()),
        Err(idx) if idx < ring.len() => Some(ring[idx].1.clone()),
        Err(_) => Some(ring[0].1.clone()),
    }
}

pub struct HashLoadBalance {
    key_extractor: Arc<dyn KeyExtractor>,
    ring: ArcSwap<Vec<(u64, ServerInstance)>>,
}

impl HashLoadBalance {
    pub fn new(key_extractor: Arc<dyn KeyExtractor>) -> Self {
        Self {
            key_extractor,
            ring: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl LoadBalance for HashLoadBalance {
    fn update(&self, instances: Vec<ServerInstance>) {
        let eligible = super::only_ok(&instances);
        self.ring.store(Arc::new(build_ring(&eligible)));
    }

    fn select(&self, code: u16, body: &[u8]) -> Selection {
        let Some(key) = self.key_extractor.extract(code, body) else {
            return Selection::Many(Vec::new());
        };
        match pick_from_ring(&self.ring.load(), key) {
            Some(instance) => Selection::One(instance),
            None => Selection::Many(Vec::new()),
        }
    }
}
