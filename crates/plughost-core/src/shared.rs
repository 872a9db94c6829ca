//! Process-wide registry of shared modules.
//!
//! A name registered here is never loaded into an isolated context. Every
//! context that references it is handed the one instance already loaded by
//! the host, so types and statics coming from that module stay unique.

use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashSet;

use crate::identity::ModuleIdentity;
use crate::module::{DependencyResolver, ModuleImage};

struct SharedEntry {
    identity: ModuleIdentity,
    instance: Arc<dyn ModuleImage>,
}

#[derive(Default)]
struct Registry {
    entries: Vec<SharedEntry>,
    identities: FxHashSet<ModuleIdentity>,
}

/// Ordered, append-only set of shared modules.
///
/// Registration happens at startup (the core module, then the tooling API
/// module in editor mode); afterwards the set is only read, once per load.
#[derive(Default)]
pub struct SharedDependencySet {
    registry: RwLock<Registry>,
}

impl SharedDependencySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-loaded module as shared.
    ///
    /// Returns `false` if an instance with the same identity was registered
    /// before, in which case the set is left unchanged.
    pub fn register(&self, instance: Arc<dyn ModuleImage>) -> bool {
        let identity = instance.identity().clone();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);

        if !registry.identities.insert(identity.clone()) {
            tracing::debug!("Shared module {} already registered", identity);
            return false;
        }

        tracing::info!("Registered shared module {}", identity);
        registry.entries.push(SharedEntry { identity, instance });
        true
    }

    /// Names of all shared modules, in registration order.
    pub fn resolve_shared_names(&self) -> Vec<String> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .entries
            .iter()
            .map(|entry| entry.identity.name().to_string())
            .collect()
    }

    /// Check whether an identity is registered.
    pub fn contains(&self, identity: &ModuleIdentity) -> bool {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.identities.contains(identity)
    }

    pub fn len(&self) -> usize {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DependencyResolver for SharedDependencySet {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ModuleImage>> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .entries
            .iter()
            .find(|entry| entry.identity.name() == name)
            .map(|entry| Arc::clone(&entry.instance))
    }
}
