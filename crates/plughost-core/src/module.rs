//! Traits at the seam between contexts and whatever actually maps modules.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::identity::{ModuleIdentity, library_file_name};

/// Entry point exported by tooling modules.
///
/// Receives the host's unmanaged callback table and its size and returns an
/// opaque instance pointer (null on failure).
pub type ToolingEntryFn = unsafe extern "C" fn(*const c_void, i32) -> *mut c_void;

/// Native handle of the host process, handed to modules that import from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostHandle(usize);

impl HostHandle {
    /// Wrap a raw host handle.
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr as usize)
    }

    /// Raw pointer form of the handle.
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A module mapped into the process.
///
/// Dropping the last `Arc` to an image unmaps it.
pub trait ModuleImage: Send + Sync {
    /// Identity the module was opened under.
    fn identity(&self) -> &ModuleIdentity;

    /// Names of the modules this one references.
    fn dependencies(&self) -> &[String];

    /// Look up the tooling entry point by symbol name.
    fn tooling_entry(&self, symbol: &str) -> Result<ToolingEntryFn>;

    /// Point the module's native imports at the host.
    fn bind_host(&self, host: HostHandle) -> Result<()>;
}

/// Strategy for mapping module files.
pub trait ModuleBackend: Send + Sync {
    /// Decide the path the module at `requested` is actually mapped from.
    ///
    /// May relocate the file (for example to a shadow copy) so the original
    /// can be overwritten while the module stays loaded.
    fn prepare(&self, requested: &Path) -> Result<PathBuf>;

    /// Map the module at `load_path` under `identity`.
    fn open(&self, identity: &ModuleIdentity, load_path: &Path) -> Result<Arc<dyn ModuleImage>>;

    /// Where a private dependency called `name` of the module at `requester` lives.
    fn locate(&self, name: &str, requester: &Path) -> PathBuf {
        requester
            .parent()
            .unwrap_or(Path::new("."))
            .join(library_file_name(name))
    }

    /// Called once a prepared path is no longer mapped by anything.
    fn release(&self, _load_path: &Path) {}
}

/// Resolves dependency names to already-loaded, process-wide instances.
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ModuleImage>>;
}
