//! Collaborators the bridge drives but does not implement itself.

use std::ffi::c_void;
use std::sync::Arc;

use plughost_core::{
    Clock, DeferredReleaseQueue, DylibBackend, MemoryManager, ModuleBackend, ModuleRef,
    SystemClock,
};

use crate::config::BridgeConfig;
use crate::error::Result;

/// Discovers scripts in a freshly loaded project module.
///
/// Runs once per successful project load. Implementations must not keep
/// the [`ModuleRef`] past the call, or the project can never be unloaded.
pub trait ScriptLookup: Send + Sync {
    fn lookup_scripts(&self, module: &ModuleRef) -> Result<()>;
}

/// Script lookup that only logs the module.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingScriptLookup;

impl ScriptLookup for LoggingScriptLookup {
    fn lookup_scripts(&self, module: &ModuleRef) -> Result<()> {
        tracing::info!(
            generation = module.generation(),
            "Looking up scripts in {}",
            module.identity()
        );
        Ok(())
    }
}

/// Table of entry points the host calls for per-frame and script work.
///
/// Opaque to the bridge: it is handed over to the host at initialize
/// exactly as the embedder supplied it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ManagedCallbacks {
    pub table: *const c_void,
    pub len: usize,
}

// SAFETY: the table is static data owned by the embedder; the bridge only
// copies the pointer.
unsafe impl Send for ManagedCallbacks {}
unsafe impl Sync for ManagedCallbacks {}

impl Default for ManagedCallbacks {
    fn default() -> Self {
        Self {
            table: std::ptr::null(),
            len: 0,
        }
    }
}

/// Unmanaged callback table the host passes in at initialize, for modules
/// that call back into the host.
#[derive(Debug, Clone, Copy)]
pub struct HostCallbacks {
    pub table: *const c_void,
    pub size: i32,
}

// SAFETY: owned by the host for the lifetime of the process.
unsafe impl Send for HostCallbacks {}
unsafe impl Sync for HostCallbacks {}

impl Default for HostCallbacks {
    fn default() -> Self {
        Self {
            table: std::ptr::null(),
            size: 0,
        }
    }
}

/// Everything the bridge needs from its embedder.
///
/// Installed with [`install_services`](crate::ffi::install_services) before
/// the host initializes the bridge.
pub struct BridgeServices {
    pub config: BridgeConfig,
    /// Module backend. `None` builds a [`DylibBackend`] from the config.
    pub backend: Option<Arc<dyn ModuleBackend>>,
    pub memory: Arc<dyn MemoryManager>,
    pub clock: Arc<dyn Clock>,
    pub script_lookup: Arc<dyn ScriptLookup>,
    pub managed_callbacks: ManagedCallbacks,
}

impl BridgeServices {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            backend: None,
            memory: Arc::new(DeferredReleaseQueue::new()),
            clock: Arc::new(SystemClock),
            script_lookup: Arc::new(LoggingScriptLookup),
            managed_callbacks: ManagedCallbacks::default(),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ModuleBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_memory_manager(mut self, memory: Arc<dyn MemoryManager>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_script_lookup(mut self, script_lookup: Arc<dyn ScriptLookup>) -> Self {
        self.script_lookup = script_lookup;
        self
    }

    pub fn with_managed_callbacks(mut self, managed_callbacks: ManagedCallbacks) -> Self {
        self.managed_callbacks = managed_callbacks;
        self
    }

    /// The configured backend, or a [`DylibBackend`] that shadow copies
    /// when the loader config asks for it given `hot_reload`.
    pub(crate) fn resolve_backend(&self, hot_reload: bool) -> Arc<dyn ModuleBackend> {
        if let Some(backend) = &self.backend {
            return Arc::clone(backend);
        }
        let loader = &self.config.loader;
        if loader.shadow_copy.enabled(hot_reload) {
            tracing::debug!("Shadow copying modules into {}", loader.shadow_dir.display());
            Arc::new(DylibBackend::with_shadow_copies(loader.shadow_dir.clone()))
        } else {
            Arc::new(DylibBackend::new())
        }
    }
}

impl Default for BridgeServices {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}
