//! Registry driver resolution by URL scheme (spec §9 "Global
//! registry-plugin resolution"): a registrar table keyed by scheme,
//! populated via explicit registration at process init, never implicit
//! discovery — the same pattern the teacher crate uses for its transport
//! and name-resolver registries (`GLOBAL_REGISTRY`, `ResolverRegistry`).

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::Registry;

/// Builds a concrete [`Registry`] for a given scheme's address (e.g. the
/// part of `consul://127.0.0.1:8500` after the scheme).
pub trait RegistryBuilder: Send + Sync {
    fn build(&self, address: &str) -> Result<Arc<dyn Registry>, String>;
}

/// A scheme -> builder table. Entirely explicit: nothing is auto-discovered.
#[derive(Default)]
pub struct Registrar {
    builders: Mutex<HashMap<String, Arc<dyn RegistryBuilder>>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, scheme: impl Into<String>, builder: impl RegistryBuilder + 'static) {
        self.builders.lock().insert(scheme.into(), Arc::new(builder));
    }

    /// Resolve `target` (a `scheme://address` string) to a built registry.
    pub fn resolve(&self, target: &str) -> Result<Arc<dyn Registry>, String> {
        let (scheme, address) = target
            .split_once("://")
            .ok_or_else(|| format!("{target:?} is not a scheme://address target"))?;
        let builder = self
            .builders
            .lock()
            .get(scheme)
            .cloned()
            .ok_or_else(|| format!("no registry plugin registered for scheme {scheme:?}"))?;
        builder.build(address)
    }
}

/// The process-wide registrar used unless the embedder supplies its own.
pub static GLOBAL_REGISTRAR: Lazy<Registrar> = Lazy::new(Registrar::new);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::MockRegistry;

    struct MockBuilder;
    impl RegistryBuilder for MockBuilder {
        fn build(&self, _address: &str) -> Result<Arc<dyn Registry>, String> {
            Ok(Arc::new(MockRegistry::new()))
        }
    }

    #[test]
    fn resolves_registered_scheme() {
        let registrar = Registrar::new();
        registrar.register("mock", MockBuilder);
        assert!(registrar.resolve("mock://localhost:1234").is_ok());
    }

    #[test]
    fn unknown_scheme_errors() {
        let registrar = Registrar::new();
        assert!(registrar.resolve("consul://localhost:8500").is_err());
    }

    #[test]
    fn malformed_target_errors() {
        let registrar = Registrar::new();
        assert!(registrar.resolve("not-a-url").is_err());
    }
}
