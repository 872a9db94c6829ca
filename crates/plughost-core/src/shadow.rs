//! Shadow copies of module files.
//!
//! A mapped library cannot be overwritten on Windows, and overwriting it in
//! place elsewhere corrupts the running image. To let a module be rebuilt
//! while it is loaded, each load maps a uuid-named copy instead:
//!
//! 1. `prepare_for_load` copies `game.so` to `<shadow dir>/game-<uuid>.so`
//! 2. the copy is mapped and reported as the actual load path
//! 3. `release` marks the copy unused once its context is reclaimed
//! 4. `cleanup_old_copies` / `cleanup_all` delete unused copies

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// Tracks uuid-named copies of module files.
pub struct ShadowCopier {
    /// Directory receiving the copies.
    shadow_dir: PathBuf,

    /// Copies still mapped. Key: copy path, value: original path.
    active_copies: HashMap<PathBuf, PathBuf>,

    /// Minimum age of an unused copy before `cleanup_old_copies` removes it.
    max_age: Duration,
}

impl ShadowCopier {
    pub fn new(shadow_dir: PathBuf) -> Self {
        Self {
            shadow_dir,
            active_copies: HashMap::new(),
            max_age: Duration::from_secs(3600),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Copy `module_path` into the shadow directory and return the copy's path.
    pub fn prepare_for_load(&mut self, module_path: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.shadow_dir)?;

        let stem = module_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module");
        let copy_name = match module_path.extension().and_then(|s| s.to_str()) {
            Some(extension) => format!("{}-{}.{}", stem, Uuid::new_v4(), extension),
            None => format!("{}-{}", stem, Uuid::new_v4()),
        };
        let copy_path = self.shadow_dir.join(copy_name);

        fs::copy(module_path, &copy_path)?;
        self.active_copies
            .insert(copy_path.clone(), module_path.to_path_buf());

        tracing::debug!(
            "Created shadow copy: {} -> {}",
            module_path.display(),
            copy_path.display()
        );

        Ok(copy_path)
    }

    /// Mark a copy returned by `prepare_for_load` as no longer mapped and
    /// try to delete it.
    ///
    /// Deletion can fail while the OS still holds the file (Windows); the
    /// copy is then left for a later cleanup.
    pub fn release(&mut self, copy_path: &Path) {
        if self.active_copies.remove(copy_path).is_none() {
            return;
        }
        match fs::remove_file(copy_path) {
            Ok(()) => tracing::debug!("Removed shadow copy {}", copy_path.display()),
            Err(e) => tracing::debug!(
                "Shadow copy {} left for cleanup: {}",
                copy_path.display(),
                e
            ),
        }
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.active_copies.contains_key(path)
    }

    /// Original file a copy was made from.
    pub fn original_of(&self, copy_path: &Path) -> Option<&Path> {
        self.active_copies.get(copy_path).map(PathBuf::as_path)
    }

    pub fn active_paths(&self) -> impl Iterator<Item = &Path> {
        self.active_copies.keys().map(|p| p.as_path())
    }

    /// Remove unused copies older than `max_age`.
    ///
    /// Returns the number of files removed.
    pub fn cleanup_old_copies(&self) -> io::Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let removed = self.remove_unused(|entry| {
            entry
                .metadata()
                .and_then(|m| m.modified())
                .is_ok_and(|modified| modified < cutoff)
        })?;

        if removed > 0 {
            tracing::info!("Removed {} stale shadow copies", removed);
        }
        Ok(removed)
    }

    /// Remove every unused library file in the shadow directory, whatever
    /// its age. Files still locked by the OS are skipped.
    pub fn cleanup_all(&self) -> io::Result<usize> {
        self.remove_unused(|entry| is_library_file(&entry.path()))
    }

    /// Delete the files of the shadow directory that no context maps and
    /// that `selected` picks.
    fn remove_unused(&self, selected: impl Fn(&fs::DirEntry) -> bool) -> io::Result<usize> {
        if !self.shadow_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&self.shadow_dir)? {
            let entry = entry?;
            let path = entry.path();
            if self.active_copies.contains_key(&path) || !selected(&entry) {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!("Removed shadow copy {}", path.display());
                    removed += 1;
                }
                Err(e) => tracing::debug!("Kept shadow copy {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }

    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_dir
    }
}

fn is_library_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("dll" | "so" | "dylib")
    )
}
