//! Bridge state behind the boundary entry points.
//!
//! [`NativeBridge`] does the actual work of each entry point and reports
//! failures as [`BridgeError`]s. Turning those into status codes, and
//! keeping panics from unwinding into the host, is the job of
//! [`crate::ffi`].

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use plughost_core::{
    ContextHandle, DependencyResolver, HostHandle, Loader, ModuleIdentity, ModuleImage, ModuleRef,
    ReclaimOutcome, ReclaimWaiter, SharedDependencySet,
};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::host::HostModule;
use crate::services::{BridgeServices, HostCallbacks, ManagedCallbacks, ScriptLookup};

/// Holds the context of the project module, if one is loaded.
#[derive(Default)]
pub struct ProjectContextSlot {
    active: Option<ActiveProject>,
}

struct ActiveProject {
    handle: ContextHandle,
    resolved_path: PathBuf,
}

impl ProjectContextSlot {
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Path the active project module was actually loaded from.
    pub fn resolved_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|p| p.resolved_path.as_path())
    }

    fn store(&mut self, handle: ContextHandle, resolved_path: PathBuf) {
        debug_assert!(self.active.is_none());
        self.active = Some(ActiveProject {
            handle,
            resolved_path,
        });
    }

    /// Empty the slot, returning whatever handle it held.
    fn take(&mut self) -> ContextHandle {
        self.active
            .take()
            .map(|project| project.handle)
            .unwrap_or_default()
    }
}

/// Dependencies of `image` that do not resolve to a shared module.
///
/// A module loaded outside any context is linked by the platform loader, so
/// these names end up as separate copies rather than the process instance.
fn unshared_dependencies(image: &dyn ModuleImage, shared: &SharedDependencySet) -> Vec<String> {
    image
        .dependencies()
        .iter()
        .filter(|name| {
            let resolved = shared.resolve(name).is_some();
            if resolved {
                tracing::debug!("{} resolves {} to the shared instance", image.identity(), name);
            }
            !resolved
        })
        .cloned()
        .collect()
}

/// Everything set up by initialize and used by the later entry points.
pub struct NativeBridge {
    config: BridgeConfig,
    host: HostHandle,
    editor_mode: bool,
    loader: Loader,
    waiter: ReclaimWaiter,
    script_lookup: Arc<dyn ScriptLookup>,
    managed_callbacks: ManagedCallbacks,
    host_callbacks: HostCallbacks,
    tooling_api: Option<ModuleIdentity>,
    tooling: Vec<ModuleRef>,
    project: ProjectContextSlot,
}

impl NativeBridge {
    /// Register the host's core module as shared and, in editor mode, load
    /// and share the tooling API module.
    pub fn initialize(host: HostHandle, editor_mode: bool, services: BridgeServices) -> Result<Self> {
        if host.is_null() {
            return Err(BridgeError::InvalidArgument(
                "core module handle is null".to_string(),
            ));
        }
        services.config.validate()?;

        let backend = services.resolve_backend(editor_mode);
        let BridgeServices {
            config,
            memory,
            clock,
            script_lookup,
            managed_callbacks,
            ..
        } = services;

        let shared = Arc::new(SharedDependencySet::new());
        shared.register(Arc::new(HostModule::new(&config.core_module_name, host)));
        let loader = Loader::new(backend, shared);

        let tooling_api = if editor_mode {
            let path = config
                .editor_api_path
                .as_deref()
                .ok_or(BridgeError::EditorApiNotConfigured)?;
            let image = loader.load_unisolated(path)?;
            let unshared = unshared_dependencies(image.as_ref(), loader.shared());
            if !unshared.is_empty() {
                tracing::warn!(
                    "Tooling API module {} depends on modules outside the shared set: {}",
                    image.identity(),
                    unshared.join(", ")
                );
            }
            image.bind_host(host)?;
            let identity = image.identity().clone();
            loader.shared().register(image);
            Some(identity)
        } else {
            None
        };

        let waiter = ReclaimWaiter::new(memory, clock, config.loader.reclaim);

        tracing::info!(
            editor_mode,
            shared = ?loader.shared().resolve_shared_names(),
            "Bridge initialized"
        );

        Ok(Self {
            config,
            host,
            editor_mode,
            loader,
            waiter,
            script_lookup,
            managed_callbacks,
            host_callbacks: HostCallbacks::default(),
            tooling_api,
            tooling: Vec::new(),
            project: ProjectContextSlot::default(),
        })
    }

    /// Keep the host's unmanaged callback table.
    pub fn with_host_callbacks(mut self, host_callbacks: HostCallbacks) -> Result<Self> {
        if host_callbacks.size < 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "negative callback table size {}",
                host_callbacks.size
            )));
        }
        self.host_callbacks = host_callbacks;
        Ok(self)
    }

    /// Load the project module into its own context.
    ///
    /// Returns the path the module was actually loaded from. While a project
    /// module is active this does nothing and returns that module's path,
    /// whatever `path` is.
    pub fn load_project_module(&mut self, path: &Path) -> Result<PathBuf> {
        if let Some(resolved) = self.project.resolved_path() {
            tracing::debug!(
                "Project module already loaded from {}, ignoring {}",
                resolved.display(),
                path.display()
            );
            return Ok(resolved.to_path_buf());
        }

        let (module, handle) = self.loader.load(path)?;
        let resolved = handle
            .actual_load_path()
            .unwrap_or_else(|| path.to_path_buf());
        self.project.store(handle, resolved.clone());

        self.script_lookup.lookup_scripts(&module)?;

        Ok(resolved)
    }

    /// Load a tooling module and run its entry point with the host's
    /// unmanaged callback table.
    ///
    /// Tooling modules stay loaded for the rest of the process.
    pub fn load_tooling_module(
        &mut self,
        path: &Path,
        callbacks: *const c_void,
        callbacks_size: i32,
    ) -> Result<*mut c_void> {
        let Some(tooling_api) = &self.tooling_api else {
            return Err(BridgeError::ToolingNotRegistered);
        };
        tracing::debug!("Loading tooling module against {}", tooling_api);

        let (module, _handle) = self.loader.load(path)?;
        module.image().bind_host(self.host)?;

        let entry = module.image().tooling_entry(&self.config.tooling_entry_symbol)?;
        self.tooling.push(module);

        // SAFETY: the entry point is exported by the tooling module under the
        // agreed name and signature, and the module stays mapped because it is
        // retained above.
        let instance = unsafe { entry(callbacks, callbacks_size) };
        if instance.is_null() {
            tracing::warn!(
                "Tooling entry point `{}` in {} returned null",
                self.config.tooling_entry_symbol,
                path.display()
            );
        }
        Ok(instance)
    }

    /// Unload the project module and wait for its context to be reclaimed.
    ///
    /// The slot is empty afterwards on every outcome.
    pub fn unload_project_module(&mut self) -> ReclaimOutcome {
        let mut handle = self.project.take();
        self.waiter.unload(&mut handle)
    }

    pub fn is_project_loaded(&self) -> bool {
        self.project.is_active()
    }

    pub fn project_slot(&self) -> &ProjectContextSlot {
        &self.project
    }

    pub fn editor_mode(&self) -> bool {
        self.editor_mode
    }

    /// Number of isolated contexts created, project and tooling alike.
    pub fn contexts_created(&self) -> usize {
        self.loader.contexts_created()
    }

    pub fn tooling_module_count(&self) -> usize {
        self.tooling.len()
    }

    pub fn shared(&self) -> &Arc<SharedDependencySet> {
        self.loader.shared()
    }

    pub fn managed_callbacks(&self) -> ManagedCallbacks {
        self.managed_callbacks
    }

    pub fn host_callbacks(&self) -> HostCallbacks {
        self.host_callbacks
    }
}
