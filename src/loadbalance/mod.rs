//! Load-balance policies (spec §4.6): round-robin, consistent hashing
//! (optionally time-bounded), and a none/direct pass-through. Each policy
//! selects from the latest registry view it has been given via [`update`];
//! nothing here talks to a registry directly, so the same policy works
//! whether it is fed by a [`crate::registry::cache::CachingRegistry`]
//! subscription or a test harness.

pub mod hash;
pub mod none;
pub mod round_robin;
pub mod timed_hash;

use crate::registry::ServerInstance;

/// Derives the numeric routing key for [`hash::HashLoadBalance`] from a
/// command's code and body, generalizing the source's single hard-coded
/// `accountSnowflakeExport` switch into a caller-supplied strategy per
/// command code.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, code: u16, body: &[u8]) -> Option<u64>;
}

/// What a [`LoadBalance::select`] call returns: exactly one instance for
/// policies that route a single request, or the full eligible set for
/// policies that let the caller pick (e.g. a broadcast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    One(ServerInstance),
    Many(Vec<ServerInstance>),
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        match self {
            Selection::One(_) => false,
            Selection::Many(instances) => instances.is_empty(),
        }
    }
}

/// A load-balance policy instance (spec §3 LoadBalanceState). `update` is
/// called with the full current instance set for the bound service name
/// every time the underlying registry's cached view changes; `select`
/// picks from whatever was last given.
pub trait LoadBalance: Send + Sync {
    fn update(&self, instances: Vec<ServerInstance>);
    fn select(&self, code: u16, body: &[u8]) -> Selection;
}

pub(crate) fn only_ok(instances: &[ServerInstance]) -> Vec<ServerInstance> {
    instances
        .iter()
        .filter(|i| i.status == crate::registry::Status::Ok)
        .cloned()
        .collect()
}
