//! Clean-shadow command implementation for plughost CLI.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use plughost_bridge::BridgeConfig;
use plughost_core::ShadowCopier;

/// Remove shadow copies left behind by earlier runs.
pub fn execute(dir: Option<PathBuf>, all: bool, max_age_secs: u64) -> anyhow::Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => {
            BridgeConfig::from_env()
                .context("Failed to read config from PLUGHOST_CONFIG")?
                .loader
                .shadow_dir
        }
    };

    let copier = ShadowCopier::new(dir).with_max_age(Duration::from_secs(max_age_secs));
    let removed = if all {
        copier.cleanup_all()
    } else {
        copier.cleanup_old_copies()
    }
    .with_context(|| format!("Failed to clean {}", copier.shadow_dir().display()))?;

    println!(
        "Removed {} shadow cop{} from {}",
        removed,
        if removed == 1 { "y" } else { "ies" },
        copier.shadow_dir().display()
    );
    Ok(())
}
