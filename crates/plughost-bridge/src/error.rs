//! Error types for plughost-bridge.

use thiserror::Error;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors raised beneath a boundary entry point.
///
/// None of these ever cross the boundary: each entry point logs the error
/// and returns its failure value instead.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Loading or unloading failed in the core.
    #[error(transparent)]
    Core(#[from] plughost_core::Error),

    /// An entry point other than initialize ran before initialize.
    #[error("bridge is not initialized")]
    NotInitialized,

    /// Initialize ran twice.
    #[error("bridge is already initialized")]
    AlreadyInitialized,

    /// Two entry points overlapped. The host must serialize calls.
    #[error("`{0}` called while another bridge call was running")]
    Busy(&'static str),

    /// A tooling module was requested but no tooling API module was loaded
    /// at initialize.
    #[error("the tooling API module is not loaded; start the host in editor mode")]
    ToolingNotRegistered,

    /// Editor mode requested without a tooling API module path.
    #[error("editor mode requires `editor_api_path` in the bridge configuration")]
    EditorApiNotConfigured,

    /// Bad argument from the host.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The script lookup collaborator failed.
    #[error("script lookup failed for {module}: {message}")]
    ScriptLookup { module: String, message: String },

    /// A panic was caught at the boundary.
    #[error("panic in `{entry}`: {message}")]
    Panic { entry: &'static str, message: String },
}
