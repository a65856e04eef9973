//! Service registry contract: register/unregister/lookup/subscribe with
//! change-delta notifications (spec §4.5, §6).
//!
//! The concrete backend (Consul et al.) is an external collaborator — this
//! module only specifies the contract, a generic long-poll diffing harness
//! any backend driver can build on ([`watcher`]), a caching decorator
//! ([`cache`]), and a scheme-keyed plugin registrar ([`plugin`]).

pub mod cache;
pub mod plugin;
pub mod watcher;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TenuredError;

/// Health status of a registered instance, as observed by the registry
/// layer. `DOWN` is a derived view, never set directly by a caller of
/// `register` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Critical,
    Down,
}

/// The health-check descriptor persisted alongside a [`ServerInstance`]
/// (spec §6). Inert data: the core does not interpret it, a concrete
/// provider would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub kind: HealthCheckKind,
    pub interval: std::time::Duration,
    pub timeout: std::time::Duration,
    pub deregister_after: std::time::Duration,
    pub http_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckKind {
    Http,
    Tcp,
}

/// One backend instance of a named service (spec §3). Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInstance {
    pub id: String,
    pub name: String,
    pub address: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub status: Status,
    pub health_check: Option<HealthCheck>,
}

impl ServerInstance {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            status: Status::Ok,
            health_check: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Whether this instance carries every tag in `required` (tag-intersection
    /// filtering, spec §4.5 lookup).
    pub fn matches_tags(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.tags.contains(t))
    }
}

/// An opaque handle identifying one subscription listener registration, so
/// `unsubscribe` can name exactly what to remove without keying by a
/// closure's runtime address (spec §9 "callback-typed listener identity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl ListenerId {
    pub fn new() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoked with the minimum set of changed instances (new, status-changed,
/// or gone-with-status=DOWN) for one subscription (spec §4.5, glossary
/// "deltas"). Notifications for a given subscription are delivered
/// serially (spec §5).
pub type NotifyListener = Arc<dyn Fn(&[ServerInstance]) + Send + Sync>;

/// The registry contract a driver must implement (spec §4.5, §6).
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, instance: ServerInstance) -> Result<(), TenuredError>;
    async fn unregister(&self, id: &str) -> Result<(), TenuredError>;
    /// Returns instances whose tags are a superset of `tags`.
    async fn lookup(&self, name: &str, tags: &[String]) -> Result<Vec<ServerInstance>, TenuredError>;
    async fn subscribe(
        &self,
        name: &str,
        listener_id: ListenerId,
        listener: NotifyListener,
    ) -> Result<(), TenuredError>;
    async fn unsubscribe(&self, name: &str, listener_id: ListenerId) -> Result<(), TenuredError>;
}
