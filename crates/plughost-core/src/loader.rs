//! Loading modules into isolated contexts.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::context::{ContextHandle, ModuleContext, ModuleRef};
use crate::error::Result;
use crate::identity::ModuleIdentity;
use crate::module::{ModuleBackend, ModuleImage};
use crate::shared::SharedDependencySet;

/// Creates one [`ModuleContext`] per load.
pub struct Loader {
    backend: Arc<dyn ModuleBackend>,
    shared: Arc<SharedDependencySet>,
    contexts_created: AtomicUsize,
}

impl Loader {
    /// Create a loader that maps modules through `backend` and resolves
    /// shared names through `shared`.
    pub fn new(backend: Arc<dyn ModuleBackend>, shared: Arc<SharedDependencySet>) -> Self {
        Self {
            backend,
            shared,
            contexts_created: AtomicUsize::new(0),
        }
    }

    /// Load the module at `path` into a fresh isolated context.
    ///
    /// Returns the loaded root module and the handle that owns the context.
    /// The caller must keep the handle to be able to unload later, and must
    /// drop every [`ModuleRef`] before the context can be reclaimed.
    ///
    /// Nothing is left behind on failure: the half-built context and every
    /// module it opened are dropped before the error is returned.
    pub fn load(&self, path: &Path) -> Result<(ModuleRef, ContextHandle)> {
        let identity = ModuleIdentity::from_path(path)?;
        let shared_names = self.shared.resolve_shared_names();

        let context = ModuleContext::create(
            path,
            shared_names,
            self.backend.clone(),
            self.shared.clone(),
        )?;
        let module = context.load_root(identity)?;

        self.contexts_created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            generation = context.generation(),
            "Loaded module {} from {}",
            module.identity().name(),
            context.actual_load_path().display()
        );

        Ok((module, ContextHandle::new(context)))
    }

    /// Map a module straight into the process, outside any isolated
    /// context. Used for modules that get registered as shared.
    pub fn load_unisolated(&self, path: &Path) -> Result<Arc<dyn ModuleImage>> {
        let identity = ModuleIdentity::from_path(path)?;
        let image = self.backend.open(&identity, path)?;
        tracing::info!("Loaded module {} without isolation", identity);
        Ok(image)
    }

    /// Number of isolated contexts successfully created so far.
    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::Relaxed)
    }

    pub fn shared(&self) -> &Arc<SharedDependencySet> {
        &self.shared
    }
}
