//! Isolated module contexts.
//!
//! A [`ModuleContext`] owns one isolated load: the root module plus every
//! private dependency it pulled in. Shared names never get loaded here; they
//! resolve to the process-wide instance through a [`DependencyResolver`].
//!
//! Ownership is split three ways:
//!
//! ```text
//! ContextHandle ──owns──> ModuleContext ──Arc──> ContextState
//!                                                   ▲    ▲
//! ModuleRef (loaded module) ────────────Arc─────────┘    │
//! ObservationHandle ────────────────────Weak─────────────┘ + LivenessToken
//! ```
//!
//! The state is reclaimed when the last strong reference goes away. Its drop
//! clears the liveness token, which is what the unload protocol polls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::identity::ModuleIdentity;
use crate::module::{DependencyResolver, ModuleBackend, ModuleImage};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Liveness flag shared between a context and its observers.
///
/// Set when the context is created, cleared by whichever owner drops the
/// final strong reference.
#[derive(Debug)]
struct LivenessToken {
    alive: AtomicBool,
}

impl LivenessToken {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Modules reachable from inside one context.
#[derive(Default)]
struct Resolved {
    /// Every name resolved in this context, shared or private.
    by_name: FxHashMap<String, Arc<dyn ModuleImage>>,
    /// Modules this context opened itself.
    private: Vec<Arc<dyn ModuleImage>>,
    /// Relocated dependency paths, released once the context is reclaimed.
    relocated: Vec<PathBuf>,
}

struct ContextState {
    generation: u64,
    requested_path: PathBuf,
    actual_load_path: PathBuf,
    shared_names: Vec<String>,
    resolved: Mutex<Resolved>,
    unloading: AtomicBool,
    backend: Arc<dyn ModuleBackend>,
    resolver: Arc<dyn DependencyResolver>,
    token: Arc<LivenessToken>,
}

impl ContextState {
    fn resolved(&self) -> std::sync::MutexGuard<'_, Resolved> {
        self.resolved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shared(&self, name: &str) -> bool {
        self.shared_names.iter().any(|shared| shared == name)
    }

    /// Resolve `identity` inside this context, loading it privately unless
    /// it is shared or already resolved.
    fn resolve(&self, identity: &ModuleIdentity, path: &Path) -> Result<Arc<dyn ModuleImage>> {
        if self.unloading.load(Ordering::Acquire) {
            return Err(Error::ContextUnloaded);
        }

        let name = identity.name();

        if let Some(existing) = self.resolved().by_name.get(name) {
            return Ok(Arc::clone(existing));
        }

        if self.is_shared(name) {
            let instance = self
                .resolver
                .resolve(name)
                .ok_or_else(|| Error::SharedNotLoaded(name.to_string()))?;
            tracing::debug!(
                generation = self.generation,
                "Resolved shared module {} to the process instance",
                name
            );
            self.resolved()
                .by_name
                .insert(name.to_string(), Arc::clone(&instance));
            return Ok(instance);
        }

        let image = self.backend.open(identity, path)?;
        tracing::debug!(
            generation = self.generation,
            "Loaded private module {} from {}",
            name,
            path.display()
        );

        {
            let mut resolved = self.resolved();
            resolved.by_name.insert(name.to_string(), Arc::clone(&image));
            resolved.private.push(Arc::clone(&image));
        }

        for dependency in image.dependencies() {
            if self.resolved().by_name.contains_key(dependency.as_str()) {
                continue;
            }

            let dep_path = self.backend.locate(dependency, identity.origin());
            let dep_identity = ModuleIdentity::new(dependency.as_str(), dep_path.clone());
            if self.is_shared(dependency) {
                self.resolve(&dep_identity, &dep_path)?;
                continue;
            }

            let load_path = self.backend.prepare(&dep_path)?;
            if load_path != dep_path {
                self.resolved().relocated.push(load_path.clone());
            }
            self.resolve(&dep_identity, &load_path)?;
        }

        Ok(image)
    }

    fn teardown(&self) -> usize {
        self.unloading.store(true, Ordering::Release);
        let mut resolved = self.resolved();
        let released = resolved.private.len();
        resolved.private.clear();
        resolved.by_name.clear();
        released
    }
}

impl Drop for ContextState {
    fn drop(&mut self) {
        let resolved = self.resolved.get_mut().unwrap_or_else(PoisonError::into_inner);
        resolved.private.clear();
        resolved.by_name.clear();

        for path in resolved.relocated.drain(..) {
            self.backend.release(&path);
        }
        if self.actual_load_path != self.requested_path {
            self.backend.release(&self.actual_load_path);
        }

        self.token.clear();
        tracing::debug!(generation = self.generation, "Module context reclaimed");
    }
}

/// One isolated load of a module and its private dependencies.
///
/// Not `Clone`: a context has exactly one owner, normally a
/// [`ContextHandle`].
pub struct ModuleContext {
    state: Arc<ContextState>,
}

impl ModuleContext {
    /// Create an empty context for the module requested at `requested_path`.
    ///
    /// The backend decides the actual load path up front.
    pub(crate) fn create(
        requested_path: &Path,
        shared_names: Vec<String>,
        backend: Arc<dyn ModuleBackend>,
        resolver: Arc<dyn DependencyResolver>,
    ) -> Result<Self> {
        let actual_load_path = backend.prepare(requested_path)?;
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);

        if actual_load_path != requested_path {
            tracing::debug!(
                generation,
                "Module {} relocated to {}",
                requested_path.display(),
                actual_load_path.display()
            );
        }

        Ok(Self {
            state: Arc::new(ContextState {
                generation,
                requested_path: requested_path.to_path_buf(),
                actual_load_path,
                shared_names,
                resolved: Mutex::new(Resolved::default()),
                unloading: AtomicBool::new(false),
                backend,
                resolver,
                token: Arc::new(LivenessToken::new()),
            }),
        })
    }

    /// Resolve the root module inside this context.
    pub(crate) fn load_root(&self, identity: ModuleIdentity) -> Result<ModuleRef> {
        let image = self.state.resolve(&identity, &self.state.actual_load_path)?;
        Ok(ModuleRef {
            identity,
            image,
            context: Arc::clone(&self.state),
        })
    }

    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    /// Path the module was requested from.
    pub fn requested_path(&self) -> &Path {
        &self.state.requested_path
    }

    /// Path the module was actually mapped from.
    pub fn actual_load_path(&self) -> &Path {
        &self.state.actual_load_path
    }

    /// Shared names visible to this context.
    pub fn shared_names(&self) -> &[String] {
        &self.state.shared_names
    }

    /// Number of modules this context loaded itself.
    pub fn private_module_count(&self) -> usize {
        self.state.resolved().private.len()
    }

    /// Take a non-owning observation of this context.
    pub fn observe(&self) -> ObservationHandle {
        ObservationHandle {
            generation: self.state.generation,
            token: Arc::clone(&self.state.token),
            state: Arc::downgrade(&self.state),
        }
    }

    /// Release every module reference held by the context itself.
    ///
    /// Outstanding [`ModuleRef`]s still pin the context state until they are
    /// dropped; further resolution fails with [`Error::ContextUnloaded`].
    pub fn unload(&self) {
        let released = self.state.teardown();
        tracing::debug!(
            generation = self.state.generation,
            "Tore down module context, released {} private modules",
            released
        );
    }
}

/// Sole owner of a [`ModuleContext`].
///
/// Accessors only ever return data derived from the context (paths,
/// generation, observations), never the context or its state, so no caller
/// frame can end up holding a reference that outlives [`unload`](Self::unload).
#[derive(Default)]
pub struct ContextHandle {
    context: Option<ModuleContext>,
}

impl ContextHandle {
    pub(crate) fn new(context: ModuleContext) -> Self {
        Self {
            context: Some(context),
        }
    }

    /// A handle that owns nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_none()
    }

    pub fn generation(&self) -> Option<u64> {
        self.context.as_ref().map(ModuleContext::generation)
    }

    /// Resolved load path of the owned context.
    pub fn actual_load_path(&self) -> Option<PathBuf> {
        self.context
            .as_ref()
            .map(|ctx| ctx.actual_load_path().to_path_buf())
    }

    /// Shared names visible to the owned context.
    pub fn shared_names(&self) -> Option<Vec<String>> {
        self.context.as_ref().map(|ctx| ctx.shared_names().to_vec())
    }

    pub fn private_module_count(&self) -> usize {
        self.context
            .as_ref()
            .map_or(0, ModuleContext::private_module_count)
    }

    pub fn observe(&self) -> Option<ObservationHandle> {
        self.context.as_ref().map(ModuleContext::observe)
    }

    /// Tear down the owned context and give up ownership.
    ///
    /// The handle is empty afterwards. Calling this on an empty handle does
    /// nothing.
    pub fn unload(&mut self) {
        if let Some(context) = self.context.take() {
            context.unload();
        }
    }
}

/// Non-owning observation of a [`ModuleContext`].
#[derive(Clone)]
pub struct ObservationHandle {
    generation: u64,
    token: Arc<LivenessToken>,
    state: Weak<ContextState>,
}

impl ObservationHandle {
    /// Whether the observed context has not been reclaimed yet.
    pub fn is_alive(&self) -> bool {
        self.token.is_alive()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Strong references still pinning the context.
    pub fn outstanding_references(&self) -> usize {
        self.state.strong_count()
    }
}

/// A module loaded through a context.
///
/// A loaded module pins its context: the context cannot be reclaimed while
/// any clone of this is alive.
#[derive(Clone)]
pub struct ModuleRef {
    identity: ModuleIdentity,
    image: Arc<dyn ModuleImage>,
    context: Arc<ContextState>,
}

impl ModuleRef {
    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    pub fn image(&self) -> &dyn ModuleImage {
        self.image.as_ref()
    }

    /// Generation of the context this module was loaded in.
    pub fn generation(&self) -> u64 {
        self.context.generation
    }

    /// Whether `name` has been resolved in this module's context.
    ///
    /// Always `false` once the context has been torn down.
    pub fn has_dependency(&self, name: &str) -> bool {
        self.context.resolved().by_name.contains_key(name)
    }

    /// Whether `name` resolved to exactly `instance` (same allocation, not
    /// an equal copy).
    pub fn resolves_to(&self, name: &str, instance: &Arc<dyn ModuleImage>) -> bool {
        self.context
            .resolved()
            .by_name
            .get(name)
            .is_some_and(|resolved| Arc::ptr_eq(resolved, instance))
    }
}

impl std::fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRef")
            .field("identity", &self.identity)
            .field("generation", &self.context.generation)
            .finish()
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedDependencySet;
    use crate::testing::{FakeBackend, FakeModule};

    fn create(backend: &Arc<FakeBackend>, shared: &Arc<SharedDependencySet>, path: &str) -> ModuleContext {
        ModuleContext::create(
            Path::new(path),
            shared.resolve_shared_names(),
            backend.clone(),
            shared.clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_generations_are_distinct() {
        let backend = Arc::new(FakeBackend::new());
        let shared = Arc::new(SharedDependencySet::new());
        let a = create(&backend, &shared, "/mods/a.so");
        let b = create(&backend, &shared, "/mods/b.so");
        assert_ne!(a.generation(), b.generation());
    }

    #[test]
    fn test_private_dependencies_load_once() {
        let backend = Arc::new(
            FakeBackend::new()
                .with_module("game", &["util", "math"])
                .with_module("util", &["math"])
                .with_module("math", &[]),
        );
        let shared = Arc::new(SharedDependencySet::new());
        let ctx = create(&backend, &shared, "/mods/game.so");

        let root = ctx.load_root(ModuleIdentity::new("game", "/mods/game.so")).unwrap();
        assert_eq!(ctx.private_module_count(), 3);
        assert_eq!(backend.open_count("math"), 1);
        assert!(root.has_dependency("util"));
    }

    #[test]
    fn test_shared_dependency_not_loaded_privately() {
        let backend = Arc::new(FakeBackend::new().with_module("game", &["core"]));
        let shared = Arc::new(SharedDependencySet::new());
        let core = FakeModule::shared("core");
        shared.register(core.clone());

        let ctx = create(&backend, &shared, "/mods/game.so");
        let root = ctx.load_root(ModuleIdentity::new("game", "/mods/game.so")).unwrap();

        assert_eq!(backend.open_count("core"), 0);
        assert!(root.resolves_to("core", &core));
        assert_eq!(ctx.private_module_count(), 1);
    }

    #[test]
    fn test_shared_name_without_instance_fails() {
        let backend = Arc::new(FakeBackend::new().with_module("game", &["core"]));
        let shared = Arc::new(SharedDependencySet::new());
        let ctx = ModuleContext::create(
            Path::new("/mods/game.so"),
            vec!["core".to_string()],
            backend.clone(),
            shared,
        )
        .unwrap();

        let err = ctx
            .load_root(ModuleIdentity::new("game", "/mods/game.so"))
            .unwrap_err();
        assert!(matches!(err, Error::SharedNotLoaded(name) if name == "core"));
    }

    #[test]
    fn test_unload_releases_references_and_blocks_resolution() {
        let backend = Arc::new(FakeBackend::new().with_module("game", &["util"]).with_module("util", &[]));
        let shared = Arc::new(SharedDependencySet::new());
        let ctx = create(&backend, &shared, "/mods/game.so");
        let root = ctx.load_root(ModuleIdentity::new("game", "/mods/game.so")).unwrap();

        ctx.unload();
        assert_eq!(ctx.private_module_count(), 0);
        assert!(!root.has_dependency("util"));

        let err = ctx
            .load_root(ModuleIdentity::new("game", "/mods/game.so"))
            .unwrap_err();
        assert!(matches!(err, Error::ContextUnloaded));
    }

    #[test]
    fn test_module_ref_pins_context() {
        let backend = Arc::new(FakeBackend::new().with_module("game", &[]));
        let shared = Arc::new(SharedDependencySet::new());
        let ctx = create(&backend, &shared, "/mods/game.so");
        let root = ctx.load_root(ModuleIdentity::new("game", "/mods/game.so")).unwrap();
        let mut handle = ContextHandle::new(ctx);
        let observer = handle.observe().unwrap();

        handle.unload();
        assert!(handle.is_empty());
        assert!(observer.is_alive());
        assert_eq!(observer.outstanding_references(), 1);

        drop(root);
        assert!(!observer.is_alive());
        assert_eq!(observer.outstanding_references(), 0);
    }

    #[test]
    fn test_empty_handle() {
        let mut handle = ContextHandle::empty();
        assert!(handle.is_empty());
        assert!(handle.observe().is_none());
        assert!(handle.actual_load_path().is_none());
        handle.unload();
        assert!(handle.is_empty());
    }

    #[test]
    fn test_relocated_path_released_on_reclaim() {
        let backend = Arc::new(FakeBackend::new().with_module("game", &[]).relocating_to("/shadow"));
        let shared = Arc::new(SharedDependencySet::new());
        let ctx = create(&backend, &shared, "/mods/game.so");
        assert_eq!(ctx.actual_load_path(), Path::new("/shadow/game.so"));

        drop(ctx);
        assert_eq!(backend.released(), vec![PathBuf::from("/shadow/game.so")]);
    }
}
