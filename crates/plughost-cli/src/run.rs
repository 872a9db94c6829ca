//! Run command implementation for plughost CLI.
//!
//! Plays the host: initializes the bridge, loads the project module (and
//! optionally a tooling module), then unloads the project and reports
//! whether its context was reclaimed.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use plughost_bridge::{BridgeConfig, BridgeServices, NativeBridge};
use plughost_core::{HostHandle, ReclaimOutcome};

/// The CLI exports nothing to modules; this only gives them a non-null
/// handle to bind to.
static CLI_HOST: u8 = 0;

pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub editor: bool,
    pub tooling: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}

fn load_config(options: &RunOptions) -> anyhow::Result<BridgeConfig> {
    let mut config = match &options.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => BridgeConfig::from_env().context("Failed to read config from PLUGHOST_CONFIG")?,
    };

    if let Some(timeout_ms) = options.timeout_ms {
        let reclaim = &mut config.loader.reclaim;
        reclaim.timeout_ms = timeout_ms;
        reclaim.slow_warning_ms = reclaim.slow_warning_ms.min(timeout_ms);
    }

    Ok(config)
}

/// Load and unload a project module.
pub fn execute(project: &Path, options: &RunOptions) -> anyhow::Result<()> {
    let start = Instant::now();
    let config = load_config(options)?;

    let host = HostHandle::from_ptr(&CLI_HOST as *const u8 as *mut c_void);
    let mut bridge = NativeBridge::initialize(host, options.editor, BridgeServices::new(config))
        .context("Failed to initialize the bridge")?;

    println!(
        "Shared modules: {}",
        bridge.shared().resolve_shared_names().join(", ")
    );

    let loaded = bridge
        .load_project_module(project)
        .with_context(|| format!("Failed to load project module {}", project.display()))?;
    println!("Loaded {} from {}", project.display(), loaded.display());

    if let Some(tooling) = &options.tooling {
        let instance = bridge
            .load_tooling_module(tooling, std::ptr::null(), 0)
            .with_context(|| format!("Failed to load tooling module {}", tooling.display()))?;
        println!("Tooling module {} returned {:p}", tooling.display(), instance);
    }

    match bridge.unload_project_module() {
        ReclaimOutcome::AlreadyEmpty => println!("Nothing to unload"),
        ReclaimOutcome::Reclaimed {
            passes,
            elapsed,
            slow_warned,
        } => println!(
            "Unloaded after {} reclamation pass(es) in {:.3}s{}",
            passes,
            elapsed.as_secs_f64(),
            if slow_warned { " (slow)" } else { "" }
        ),
        ReclaimOutcome::TimedOut {
            passes,
            elapsed,
            outstanding,
            ..
        } => anyhow::bail!(
            "Project module was not reclaimed after {} pass(es) in {:.3}s ({} reference(s) outstanding)",
            passes,
            elapsed.as_secs_f64(),
            outstanding
        ),
    }

    println!("Completed in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(timeout_ms: Option<u64>) -> RunOptions {
        RunOptions {
            config: None,
            editor: false,
            tooling: None,
            timeout_ms,
        }
    }

    #[test]
    fn test_timeout_override_clamps_slow_warning() {
        let config = load_config(&options(Some(500))).unwrap();
        assert_eq!(config.loader.reclaim.timeout_ms, 500);
        assert_eq!(config.loader.reclaim.slow_warning_ms, 500);
    }

    #[test]
    fn test_defaults_without_override() {
        let config = load_config(&options(None)).unwrap();
        assert_eq!(config.loader.reclaim.timeout_ms, 5000);
        assert_eq!(config.loader.reclaim.slow_warning_ms, 2000);
    }
}
