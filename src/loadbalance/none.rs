//! Pass-through policy: the caller does its own selection (e.g. broadcast
//! to every instance), so `select` just hands back the latest view
//! unchanged (spec §4.6 NoneLoadBalance).

use parking_lot::RwLock;

use super::{LoadBalance, Selection};
use crate::registry::ServerInstance;

#[derive(Default)]
pub struct NoneLoadBalance {
    instances: RwLock<Vec<ServerInstance>>,
}

impl NoneLoadBalance {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for NoneLoadBalance {
    fn update(&self, instances: Vec<ServerInstance>) {
        *self.instances.write() = instances;
    }

    fn select(&self, _code: u16, _body: &[u8]) -> Selection {
        Selection::Many(self.instances.read().clone())
    }
}
