//! Error types for plughost-core.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for plughost-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading or unloading modules.
#[derive(Debug, Error)]
pub enum Error {
    /// The path does not name a loadable module.
    #[error("invalid module path: {}", .0.display())]
    InvalidPath(PathBuf),

    /// A module requested during resolution could not be found.
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// A name is registered as shared but has no loaded instance.
    #[error("shared module `{0}` is registered but not loaded")]
    SharedNotLoaded(String),

    /// A symbol could not be found in a loaded module.
    #[error("symbol `{symbol}` not found in module {module}")]
    SymbolNotFound { module: String, symbol: String },

    /// The module context has already been torn down.
    #[error("module context has been unloaded")]
    ContextUnloaded,

    /// Failed to load dynamic library.
    #[error("failed to load library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// Malformed dependency manifest.
    #[error("dependency manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
