//! Dynamic-library backend built on `libloading`.
//!
//! # Module layout
//!
//! ```text
//! bin/
//! ├── libgame.so           # module
//! ├── libgame.deps.json    # optional: {"dependencies": ["core", "physics"]}
//! └── libphysics.so        # private dependency, located by name
//! ```
//!
//! A module may export:
//!
//! - `plughost_bind_host(*mut c_void)`: receives the host's native handle
//! - `plughost_tooling_create_instance(*const c_void, i32) -> *mut c_void`:
//!   tooling entry point (the symbol name is configurable)

use std::ffi::c_void;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use libloading::{Library, Symbol};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::identity::ModuleIdentity;
use crate::module::{HostHandle, ModuleBackend, ModuleImage, ToolingEntryFn};
use crate::shadow::ShadowCopier;

/// Symbol receiving the host handle.
pub const BIND_HOST_SYMBOL: &str = "plughost_bind_host";

type BindHostFn = unsafe extern "C" fn(*mut c_void);

#[derive(Debug, Default, Deserialize)]
struct DependencyManifest {
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Sidecar manifest path for a module: `libgame.so` -> `libgame.deps.json`.
pub fn manifest_path(module_path: &Path) -> PathBuf {
    module_path.with_extension("deps.json")
}

fn read_manifest(module_path: &Path) -> Result<Vec<String>> {
    let path = manifest_path(module_path);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let manifest: DependencyManifest =
        serde_json::from_str(&contents).map_err(|source| Error::Manifest { path, source })?;
    Ok(manifest.dependencies)
}

/// A mapped dynamic library.
pub struct DylibImage {
    identity: ModuleIdentity,
    load_path: PathBuf,
    dependencies: Vec<String>,
    library: Library,
}

impl DylibImage {
    /// Path the library was mapped from.
    pub fn load_path(&self) -> &Path {
        &self.load_path
    }
}

impl ModuleImage for DylibImage {
    fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn tooling_entry(&self, symbol: &str) -> Result<ToolingEntryFn> {
        // SAFETY: the symbol is trusted to have the `ToolingEntryFn`
        // signature. The copied fn pointer is only valid while the library
        // stays mapped, which callers guarantee by holding the image.
        let entry: Symbol<ToolingEntryFn> = unsafe { self.library.get(symbol.as_bytes()) }
            .map_err(|_| Error::SymbolNotFound {
                module: self.identity.name().to_string(),
                symbol: symbol.to_string(),
            })?;
        Ok(*entry)
    }

    fn bind_host(&self, host: HostHandle) -> Result<()> {
        // SAFETY: same contract as above for `BindHostFn`.
        let bind: Symbol<BindHostFn> = match unsafe { self.library.get(BIND_HOST_SYMBOL.as_bytes()) } {
            Ok(bind) => bind,
            Err(_) => {
                tracing::debug!("Module {} imports nothing from the host", self.identity.name());
                return Ok(());
            }
        };
        unsafe { bind(host.as_ptr()) };
        tracing::debug!("Bound host imports for module {}", self.identity.name());
        Ok(())
    }
}

/// Maps modules with `libloading`, optionally through shadow copies.
pub struct DylibBackend {
    shadow: Option<Mutex<ShadowCopier>>,
}

impl DylibBackend {
    /// Map modules in place.
    pub fn new() -> Self {
        Self { shadow: None }
    }

    /// Map shadow copies stored in `shadow_dir`.
    pub fn with_shadow_copies(shadow_dir: PathBuf) -> Self {
        Self {
            shadow: Some(Mutex::new(ShadowCopier::new(shadow_dir))),
        }
    }

    pub fn shadow_copies_enabled(&self) -> bool {
        self.shadow.is_some()
    }
}

impl Default for DylibBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBackend for DylibBackend {
    fn prepare(&self, requested: &Path) -> Result<PathBuf> {
        match &self.shadow {
            Some(shadow) => Ok(shadow
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .prepare_for_load(requested)?),
            None => Ok(requested.to_path_buf()),
        }
    }

    fn open(&self, identity: &ModuleIdentity, load_path: &Path) -> Result<Arc<dyn ModuleImage>> {
        if !load_path.exists() {
            return Err(Error::ModuleNotFound(format!(
                "{} ({})",
                identity.name(),
                load_path.display()
            )));
        }

        // Dependencies are declared next to the original, not the copy.
        let dependencies = read_manifest(identity.origin())?;

        // SAFETY: loading a library runs its initializers; modules handed to
        // the host are trusted code.
        let library = unsafe { Library::new(load_path) }?;

        Ok(Arc::new(DylibImage {
            identity: identity.clone(),
            load_path: load_path.to_path_buf(),
            dependencies,
            library,
        }))
    }

    fn release(&self, load_path: &Path) {
        if let Some(shadow) = &self.shadow {
            shadow
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release(load_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::library_file_name;
    use tempfile::tempdir;

    #[test]
    fn test_manifest_path() {
        assert_eq!(
            manifest_path(Path::new("/bin/libgame.so")),
            PathBuf::from("/bin/libgame.deps.json")
        );
    }

    #[test]
    fn test_missing_manifest_means_no_dependencies() {
        let temp = tempdir().unwrap();
        let deps = read_manifest(&temp.path().join("libgame.so")).unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn test_manifest_lists_dependencies() {
        let temp = tempdir().unwrap();
        let module = temp.path().join("libgame.so");
        fs::write(
            manifest_path(&module),
            r#"{ "dependencies": ["core", "physics"] }"#,
        )
        .unwrap();

        assert_eq!(read_manifest(&module).unwrap(), vec!["core", "physics"]);
    }

    #[test]
    fn test_malformed_manifest() {
        let temp = tempdir().unwrap();
        let module = temp.path().join("libgame.so");
        fs::write(manifest_path(&module), "[1, 2").unwrap();

        assert!(matches!(read_manifest(&module), Err(Error::Manifest { .. })));
    }

    #[test]
    fn test_open_missing_module() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(library_file_name("absent"));
        let identity = ModuleIdentity::from_path(&path).unwrap();

        let err = DylibBackend::new().open(&identity, &path).err().unwrap();
        assert!(matches!(err, Error::ModuleNotFound(_)));
    }

    #[test]
    fn test_open_rejects_non_library() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(library_file_name("garbage"));
        fs::write(&path, b"definitely not an object file").unwrap();
        let identity = ModuleIdentity::from_path(&path).unwrap();

        let err = DylibBackend::new().open(&identity, &path).err().unwrap();
        assert!(matches!(err, Error::LibraryLoad(_)));
    }

    #[test]
    fn test_prepare_without_shadow_is_identity() {
        let backend = DylibBackend::new();
        let path = Path::new("/bin/libgame.so");
        assert_eq!(backend.prepare(path).unwrap(), path);
        assert!(!backend.shadow_copies_enabled());
    }

    #[test]
    fn test_prepare_and_release_with_shadow() {
        let temp = tempdir().unwrap();
        let module = temp.path().join(library_file_name("game"));
        fs::write(&module, b"module").unwrap();

        let backend = DylibBackend::with_shadow_copies(temp.path().join("shadow"));
        let copy = backend.prepare(&module).unwrap();
        assert_ne!(copy, module);
        assert!(copy.exists());

        backend.release(&copy);
        assert!(!copy.exists());
    }
}
