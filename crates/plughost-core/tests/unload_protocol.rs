//! Integration tests for the load/unload lifecycle through the public API.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use plughost_core::{
    ContextHandle, DeferredReleaseQueue, DylibBackend, Error, HostHandle, Loader, ModuleBackend,
    ModuleIdentity, ModuleImage, ReclaimConfig, ReclaimOutcome, ReclaimWaiter, Result,
    SharedDependencySet, SystemClock, ToolingEntryFn, library_file_name,
};
use tempfile::tempdir;

/// Module image with no code behind it.
struct InertImage {
    identity: ModuleIdentity,
}

impl ModuleImage for InertImage {
    fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    fn dependencies(&self) -> &[String] {
        &[]
    }

    fn tooling_entry(&self, symbol: &str) -> Result<ToolingEntryFn> {
        Err(Error::SymbolNotFound {
            module: self.identity.name().to_string(),
            symbol: symbol.to_string(),
        })
    }

    fn bind_host(&self, _host: HostHandle) -> Result<()> {
        Ok(())
    }
}

/// Backend that opens any path as an inert image.
struct InertBackend;

impl ModuleBackend for InertBackend {
    fn prepare(&self, requested: &Path) -> Result<PathBuf> {
        Ok(requested.to_path_buf())
    }

    fn open(&self, identity: &ModuleIdentity, _load_path: &Path) -> Result<Arc<dyn ModuleImage>> {
        Ok(Arc::new(InertImage {
            identity: identity.clone(),
        }))
    }
}

fn fast_config() -> ReclaimConfig {
    ReclaimConfig {
        slow_warning_ms: 20,
        timeout_ms: 100,
        poll_interval_ms: 5,
    }
}

fn load_project(loader: &Loader) -> (plughost_core::ModuleRef, ContextHandle) {
    loader
        .load(&PathBuf::from("/game").join(library_file_name("project")))
        .unwrap()
}

#[test]
fn test_unload_with_wall_clock_succeeds_once_released() {
    let loader = Loader::new(Arc::new(InertBackend), Arc::new(SharedDependencySet::new()));
    let (module, mut handle) = load_project(&loader);

    let queue = DeferredReleaseQueue::new();
    queue.defer(module);

    let waiter = ReclaimWaiter::new(Arc::new(queue.clone()), Arc::new(SystemClock), fast_config());
    let outcome = waiter.unload(&mut handle);

    assert!(matches!(outcome, ReclaimOutcome::Reclaimed { passes: 1, .. }));
    assert!(handle.is_empty());
}

#[test]
fn test_unload_with_wall_clock_times_out_on_retained_module() {
    let loader = Loader::new(Arc::new(InertBackend), Arc::new(SharedDependencySet::new()));
    let (module, mut handle) = load_project(&loader);

    let waiter = ReclaimWaiter::new(
        Arc::new(DeferredReleaseQueue::new()),
        Arc::new(SystemClock),
        fast_config(),
    );
    let outcome = waiter.unload(&mut handle);

    match outcome {
        ReclaimOutcome::TimedOut {
            elapsed,
            outstanding,
            ..
        } => {
            assert!(elapsed >= Duration::from_millis(100));
            assert_eq!(outstanding, 1);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(handle.is_empty());
    assert_eq!(module.identity().name(), "project");
}

#[test]
fn test_unload_waits_for_background_thread() {
    let loader = Loader::new(Arc::new(InertBackend), Arc::new(SharedDependencySet::new()));
    let (module, mut handle) = load_project(&loader);

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        drop(module);
    });

    let config = ReclaimConfig {
        timeout_ms: 5000,
        ..fast_config()
    };
    let waiter = ReclaimWaiter::new(
        Arc::new(DeferredReleaseQueue::new()),
        Arc::new(SystemClock),
        config,
    );
    let outcome = waiter.unload(&mut handle);
    worker.join().unwrap();

    match outcome {
        ReclaimOutcome::Reclaimed { passes, .. } => assert!(passes > 1),
        other => panic!("expected reclamation, got {:?}", other),
    }
}

#[test]
fn test_failed_dylib_load_removes_shadow_copy() {
    let temp = tempdir().unwrap();
    let module = temp.path().join(library_file_name("broken"));
    fs::write(&module, b"not a library").unwrap();
    let shadow_dir = temp.path().join("shadow");

    let backend = Arc::new(DylibBackend::with_shadow_copies(shadow_dir.clone()));
    let loader = Loader::new(backend, Arc::new(SharedDependencySet::new()));

    let err = loader.load(&module).err().unwrap();
    assert!(matches!(err, Error::LibraryLoad(_)));
    assert_eq!(loader.contexts_created(), 0);

    let leftovers = fs::read_dir(&shadow_dir).unwrap().count();
    assert_eq!(leftovers, 0);
}
