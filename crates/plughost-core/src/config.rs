//! Loader and unload-protocol configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Whether modules are mapped from shadow copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowCopyMode {
    /// Shadow copy only when hot reload is wanted (editor mode).
    #[default]
    Auto,
    Always,
    Never,
}

impl ShadowCopyMode {
    /// Resolve the mode given whether hot reload is enabled.
    pub fn enabled(self, hot_reload: bool) -> bool {
        match self {
            Self::Auto => hot_reload,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// Configuration for mapping modules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Shadow copy policy.
    pub shadow_copy: ShadowCopyMode,

    /// Directory that receives shadow copies.
    pub shadow_dir: PathBuf,

    /// Unload protocol thresholds.
    pub reclaim: ReclaimConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            shadow_copy: ShadowCopyMode::default(),
            shadow_dir: Self::default_shadow_dir(),
            reclaim: ReclaimConfig::default(),
        }
    }
}

impl LoaderConfig {
    /// `<cache dir>/plughost/shadow`, or the temp dir when the platform has
    /// no cache dir.
    pub fn default_shadow_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("plughost")
            .join("shadow")
    }

    /// Parse configuration from a JSON file. Missing fields keep their
    /// defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Timing of the unload protocol, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Elapsed time after which a "taking longer than expected" warning is
    /// logged once.
    pub slow_warning_ms: u64,

    /// Elapsed time after which unloading is reported as failed.
    pub timeout_ms: u64,

    /// Pause between reclamation passes.
    pub poll_interval_ms: u64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            slow_warning_ms: 2000,
            timeout_ms: 5000,
            poll_interval_ms: 10,
        }
    }
}

impl ReclaimConfig {
    pub fn slow_warning(&self) -> Duration {
        Duration::from_millis(self.slow_warning_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check the thresholds are usable.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config("reclaim timeout must be positive".to_string()));
        }
        if self.slow_warning_ms > self.timeout_ms {
            return Err(Error::Config(format!(
                "slow warning ({} ms) exceeds timeout ({} ms)",
                self.slow_warning_ms, self.timeout_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.shadow_copy, ShadowCopyMode::Auto);
        assert!(config.shadow_dir.ends_with("plughost/shadow"));
        assert_eq!(config.reclaim.slow_warning(), Duration::from_secs(2));
        assert_eq!(config.reclaim.timeout(), Duration::from_secs(5));
        assert!(config.reclaim.validate().is_ok());
    }

    #[test]
    fn test_shadow_copy_mode() {
        assert!(ShadowCopyMode::Auto.enabled(true));
        assert!(!ShadowCopyMode::Auto.enabled(false));
        assert!(ShadowCopyMode::Always.enabled(false));
        assert!(!ShadowCopyMode::Never.enabled(true));
    }

    #[test]
    fn test_from_file_partial() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("plughost.json");
        std::fs::write(
            &path,
            r#"{ "shadow_copy": "always", "reclaim": { "timeout_ms": 250 } }"#,
        )
        .unwrap();

        let config = LoaderConfig::from_file(&path).unwrap();
        assert_eq!(config.shadow_copy, ShadowCopyMode::Always);
        assert_eq!(config.reclaim.timeout_ms, 250);
        assert_eq!(config.reclaim.slow_warning_ms, 2000);
        assert!(config.reclaim.validate().is_err());
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("plughost.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(LoaderConfig::from_file(&path), Err(Error::Config(_))));
    }
}
