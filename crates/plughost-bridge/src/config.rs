//! Bridge configuration.

use std::path::{Path, PathBuf};

use plughost_core::LoaderConfig;
use serde::Deserialize;

use crate::error::{BridgeError, Result};

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV: &str = "PLUGHOST_CONFIG";

/// Symbol looked up in tooling modules by default.
pub const DEFAULT_TOOLING_ENTRY: &str = "plughost_tooling_create_instance";

/// Configuration of the native bridge.
///
/// ```json
/// {
///   "core_module_name": "host_api",
///   "editor_api_path": "/opt/engine/libhost_editor_api.so",
///   "loader": { "shadow_copy": "auto", "reclaim": { "timeout_ms": 5000 } }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name under which the host's core module is shared with plugins.
    pub core_module_name: String,

    /// Tooling API module loaded and shared in editor mode.
    pub editor_api_path: Option<PathBuf>,

    /// Entry point invoked in tooling modules.
    pub tooling_entry_symbol: String,

    /// Loader and unload settings.
    pub loader: LoaderConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            core_module_name: "host_api".to_string(),
            editor_api_path: None,
            tooling_entry_symbol: DEFAULT_TOOLING_ENTRY.to_string(),
            loader: LoaderConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(plughost_core::Error::from)?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            plughost_core::Error::Config(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read the file named by `PLUGHOST_CONFIG`, or fall back to defaults
    /// when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.core_module_name.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "core_module_name must not be empty".to_string(),
            ));
        }
        if self.tooling_entry_symbol.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "tooling_entry_symbol must not be empty".to_string(),
            ));
        }
        self.loader.reclaim.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert_eq!(config.core_module_name, "host_api");
        assert_eq!(config.tooling_entry_symbol, DEFAULT_TOOLING_ENTRY);
        assert!(config.editor_api_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bridge.json");
        std::fs::write(
            &path,
            r#"{
                "core_module_name": "engine",
                "editor_api_path": "/opt/engine/libeditor.so",
                "loader": { "shadow_copy": "never" }
            }"#,
        )
        .unwrap();

        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.core_module_name, "engine");
        assert_eq!(
            config.editor_api_path,
            Some(PathBuf::from("/opt/engine/libeditor.so"))
        );
        assert_eq!(config.tooling_entry_symbol, DEFAULT_TOOLING_ENTRY);
    }

    #[test]
    fn test_from_file_rejects_empty_symbol() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bridge.json");
        std::fs::write(&path, r#"{ "tooling_entry_symbol": "" }"#).unwrap();

        assert!(matches!(
            BridgeConfig::from_file(&path),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_missing_file() {
        let temp = tempdir().unwrap();
        let err = BridgeConfig::from_file(&temp.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, BridgeError::Core(plughost_core::Error::Io(_))));
    }
}
