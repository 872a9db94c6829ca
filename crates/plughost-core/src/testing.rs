//! In-memory fakes for exercising contexts and the unload protocol without
//! real dynamic libraries or wall-clock waits.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::identity::ModuleIdentity;
use crate::module::{HostHandle, ModuleBackend, ModuleImage, ToolingEntryFn};
use crate::reclaim::{Clock, MemoryManager};

/// A module image that maps nothing.
pub struct FakeModule {
    identity: ModuleIdentity,
    dependencies: Vec<String>,
    tooling_entry: Option<(String, ToolingEntryFn)>,
    bound_host: Mutex<Option<HostHandle>>,
}

impl FakeModule {
    pub fn new(identity: ModuleIdentity, dependencies: &[&str]) -> Self {
        Self {
            identity,
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            tooling_entry: None,
            bound_host: Mutex::new(None),
        }
    }

    /// A dependency-free module standing in for one loaded by the host.
    pub fn shared(name: &str) -> Arc<dyn ModuleImage> {
        Arc::new(Self::new(
            ModuleIdentity::new(name, format!("<host>/{}", name)),
            &[],
        ))
    }

    pub fn with_tooling_entry(mut self, symbol: &str, entry: ToolingEntryFn) -> Self {
        self.tooling_entry = Some((symbol.to_string(), entry));
        self
    }

    pub fn bound_host(&self) -> Option<HostHandle> {
        *self.bound_host.lock().unwrap()
    }
}

impl ModuleImage for FakeModule {
    fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn tooling_entry(&self, symbol: &str) -> Result<ToolingEntryFn> {
        match &self.tooling_entry {
            Some((name, entry)) if name == symbol => Ok(*entry),
            _ => Err(Error::SymbolNotFound {
                module: self.identity.name().to_string(),
                symbol: symbol.to_string(),
            }),
        }
    }

    fn bind_host(&self, host: HostHandle) -> Result<()> {
        *self.bound_host.lock().unwrap() = Some(host);
        Ok(())
    }
}

#[derive(Clone)]
struct ModuleSpec {
    dependencies: Vec<String>,
    tooling_entry: Option<(String, ToolingEntryFn)>,
}

/// Backend serving [`FakeModule`]s by name.
///
/// Records every open so tests can count loads, and only keeps weak
/// references to what it handed out.
#[derive(Default)]
pub struct FakeBackend {
    modules: HashMap<String, ModuleSpec>,
    relocate_to: Option<PathBuf>,
    opened: Mutex<Vec<(ModuleIdentity, Weak<dyn ModuleImage>)>>,
    prepared: Mutex<Vec<PathBuf>>,
    released: Mutex<Vec<PathBuf>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a module called `name` with the given dependency names.
    pub fn with_module(mut self, name: &str, dependencies: &[&str]) -> Self {
        self.modules.insert(
            name.to_string(),
            ModuleSpec {
                dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
                tooling_entry: None,
            },
        );
        self
    }

    /// Serve a module called `name` exporting a tooling entry point.
    pub fn with_tooling_module(mut self, name: &str, symbol: &str, entry: ToolingEntryFn) -> Self {
        self.modules.insert(
            name.to_string(),
            ModuleSpec {
                dependencies: Vec::new(),
                tooling_entry: Some((symbol.to_string(), entry)),
            },
        );
        self
    }

    /// Relocate every prepared module into `dir`, like a shadow copy would.
    pub fn relocating_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.relocate_to = Some(dir.into());
        self
    }

    /// Number of times a module called `name` was opened.
    pub fn open_count(&self, name: &str) -> usize {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|(identity, _)| identity.name() == name)
            .count()
    }

    /// Total number of opens.
    pub fn total_opens(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// Images handed out that are still alive.
    pub fn live_images(&self) -> usize {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, image)| image.strong_count() > 0)
            .count()
    }

    /// Paths passed to `prepare`, in order.
    pub fn prepared(&self) -> Vec<PathBuf> {
        self.prepared.lock().unwrap().clone()
    }

    /// Paths passed to `release`, in order.
    pub fn released(&self) -> Vec<PathBuf> {
        self.released.lock().unwrap().clone()
    }
}

impl ModuleBackend for FakeBackend {
    fn prepare(&self, requested: &Path) -> Result<PathBuf> {
        self.prepared.lock().unwrap().push(requested.to_path_buf());
        match (&self.relocate_to, requested.file_name()) {
            (Some(dir), Some(file_name)) => Ok(dir.join(file_name)),
            _ => Ok(requested.to_path_buf()),
        }
    }

    fn open(&self, identity: &ModuleIdentity, _load_path: &Path) -> Result<Arc<dyn ModuleImage>> {
        let spec = self
            .modules
            .get(identity.name())
            .ok_or_else(|| Error::ModuleNotFound(identity.name().to_string()))?;

        let deps: Vec<&str> = spec.dependencies.iter().map(String::as_str).collect();
        let mut module = FakeModule::new(identity.clone(), &deps);
        if let Some((symbol, entry)) = &spec.tooling_entry {
            module = module.with_tooling_entry(symbol, *entry);
        }

        let image: Arc<dyn ModuleImage> = Arc::new(module);
        self.opened
            .lock()
            .unwrap()
            .push((identity.clone(), Arc::downgrade(&image)));
        Ok(image)
    }

    fn release(&self, load_path: &Path) {
        self.released.lock().unwrap().push(load_path.to_path_buf());
    }
}

/// Memory manager whose passes release values on a script.
#[derive(Default)]
pub struct ScriptedMemoryManager {
    passes: AtomicU32,
    scheduled: Mutex<Vec<(u32, Box<dyn Any + Send>)>>,
}

impl ScriptedMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `value` until pass number `pass` (1-based) runs.
    pub fn release_on_pass<T: Send + 'static>(&self, pass: u32, value: T) {
        self.scheduled.lock().unwrap().push((pass, Box::new(value)));
    }

    /// Passes run so far.
    pub fn passes(&self) -> u32 {
        self.passes.load(Ordering::SeqCst)
    }
}

impl MemoryManager for ScriptedMemoryManager {
    fn collect(&self) {
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let due: Vec<_> = {
            let mut scheduled = self.scheduled.lock().unwrap();
            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut *scheduled)
                .into_iter()
                .partition(|(at, _)| *at <= pass);
            *scheduled = pending;
            due
        };
        drop(due);
    }
}

/// Clock that only moves when slept on or advanced.
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }

    /// Total time slept or advanced.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Tooling entry point returning the callback table pointer it was given,
/// so tests can check the table made it through.
pub unsafe extern "C" fn echo_tooling_entry(callbacks: *const c_void, _size: i32) -> *mut c_void {
    callbacks as *mut c_void
}
