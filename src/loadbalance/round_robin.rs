//! Round-robin policy: atomically fetch-and-increment cursor, select
//! `instances[cursor mod len]` among OK instances only (spec §4.6
//! RoundRobinLoadBalance).

use std::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwap;

use super::{only_ok, LoadBalance, Selection};
use crate::registry::ServerInstance;

pub struct RoundRobinLoadBalance {
    instances: ArcSwap<Vec<ServerInstance>>,
    cursor: AtomicU32,
}

impl Default for RoundRobinLoadBalance {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinLoadBalance {
    pub fn new() -> Self {
        Self {
            instances: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicU32::new(0),
        }
    }
}

impl LoadBalance for RoundRobinLoadBalance {
    fn update(&self, instances: Vec<ServerInstance>) {
        self.instances.store(std::sync::Arc::new(only_ok(&instances)));
    }

    fn select(&self, _code: u16, _body: &[u8]) -> Selection {
        let instances = self.instances.load();
        if instances.is_empty() {
            return Selection::Many(Vec::new());
        }
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        let idx = (cursor as usize) % instances.len();
        Selection::One(instances[idx].clone())
    }
}
