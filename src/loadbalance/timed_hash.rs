//! Time-bounded consistent-hash policy: like [`super::hash::HashLoadBalance`]
//! but the ring is rebuilt at most once per TTL window, or immediately when
//! the instance set actually changes (spec §4.6 TimedHashLoadBalance).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::hash::{build_ring, pick_from_ring};
use super::{KeyExtractor, LoadBalance, Selection};
use crate::registry::ServerInstance;

pub const DEFAULT_TTL: Duration = Duration::from_millis(100);

pub struct TimedHashLoadBalance {
    key_extractor: Arc<dyn KeyExtractor>,
    ttl: Duration,
    raw: ArcSwap<Vec<ServerInstance>>,
    ring: ArcSwap<Vec<(u64, ServerInstance)>>,
    last_build: Mutex<Instant>,
}

fn instance_ids(instances: &[ServerInstance]) -> BTreeSet<&str> {
    instances.iter().map(|i| i.id.as_str()).collect()
}

impl TimedHashLoadBalance {
    pub fn new(key_extractor: Arc<dyn KeyExtractor>, ttl: Duration) -> Self {
        Self {
            key_extractor,
            ttl,
            raw: ArcSwap::from_pointee(Vec::new()),
            ring: ArcSwap::from_pointee(Vec::new()),
            last_build: Mutex::new(Instant::now() - ttl - Duration::from_secs(1)),
        }
    }

    fn rebuild(&self) {
        let eligible = super::only_ok(&self.raw.load());
        self.ring.store(Arc::new(build_ring(&eligible)));
        *self.last_build.lock() = Instant::now();
    }
}

impl LoadBalance for TimedHashLoadBalance {
    fn update(&self, instances: Vec<ServerInstance>) {
        let changed = {
            let current = self.raw.load();
            let old = instance_ids(&current);
            let new = instance_ids(&instances);
            old != new
        };
        self.raw.store(Arc::new(instances));
        if changed {
            self.rebuild();
        }
    }

    fn select(&self, code: u16, body: &[u8]) -> Selection {
        if self.last_build.lock().elapsed() >= self.ttl {
            self.rebuild();
        }
        let Some(key) = self.key_extractor.extract(code, body) else {
            return Selection::Many(Vec::new());
        };
        match pick_from_ring(&self.ring.load(), key) {
            Some(instance) => Selection::One(instance),
            None => Selection::Many(Vec::new()),
        }
    }
}
