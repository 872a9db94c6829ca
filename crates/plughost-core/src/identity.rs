//! Module identities.

use std::env::consts::{DLL_EXTENSION, DLL_PREFIX};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name plus origin path of a loadable module.
///
/// Two identities are equal only when both the name and the origin match,
/// so the same module name loaded from two places is two identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentity {
    name: String,
    origin: PathBuf,
}

impl ModuleIdentity {
    /// Create an identity from its parts.
    pub fn new(name: impl Into<String>, origin: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
        }
    }

    /// Derive an identity from a module file path.
    ///
    /// The name is the file stem. For platform libraries (`libfoo.so`,
    /// `libfoo.dylib`, `foo.dll`) the platform prefix is removed as well, so
    /// the name matches what dependency manifests refer to.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPath`] if the path has no usable file stem.
    pub fn from_path(path: &Path) -> Result<Self> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;

        let is_platform_library = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == DLL_EXTENSION);

        let name = match stem.strip_prefix(DLL_PREFIX) {
            Some(stripped) if is_platform_library && !DLL_PREFIX.is_empty() && !stripped.is_empty() => {
                stripped
            }
            _ => stem,
        };

        Ok(Self::new(name, path))
    }

    /// Module name used for dependency resolution.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the module was requested from.
    pub fn origin(&self) -> &Path {
        &self.origin
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.origin.display())
    }
}

/// Platform library file name for a module name (`libfoo.so` for `foo` on Linux).
pub fn library_file_name(name: &str) -> String {
    format!("{}{}.{}", DLL_PREFIX, name, DLL_EXTENSION)
}
