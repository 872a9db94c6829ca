//! Core engine for plughost.
//!
//! This crate provides:
//! - Isolated module contexts that can be unloaded independently
//! - A process-wide registry of shared modules
//! - The unload protocol that confirms reclamation with bounded patience
//! - A `libloading` backend with shadow copies for hot reload

pub mod config;
pub mod context;
pub mod dylib;
pub mod error;
pub mod identity;
pub mod loader;
pub mod module;
pub mod reclaim;
pub mod shadow;
pub mod shared;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::{LoaderConfig, ReclaimConfig, ShadowCopyMode};
pub use context::{ContextHandle, ModuleContext, ModuleRef, ObservationHandle};
pub use dylib::{DylibBackend, DylibImage};
pub use error::{Error, Result};
pub use identity::{ModuleIdentity, library_file_name};
pub use loader::Loader;
pub use module::{DependencyResolver, HostHandle, ModuleBackend, ModuleImage, ToolingEntryFn};
pub use reclaim::{
    Clock, DeferredReleaseQueue, MemoryManager, ReclaimOutcome, ReclaimWaiter, SystemClock,
};
pub use shadow::ShadowCopier;
pub use shared::SharedDependencySet;
