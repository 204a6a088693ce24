//! Temp-directory allocation for execution contexts.

use std::io;
use std::path::{Path, PathBuf};

/// Allocates and removes the per-context working directories.
pub trait FileManager: Send + Sync {
    /// Create a fresh, uniquely named directory whose name starts with `prefix`.
    fn create_temp_dir(&self, prefix: &str) -> io::Result<PathBuf>;

    /// Recursively remove a directory created by [`FileManager::create_temp_dir`].
    /// A directory that is already gone is not an error.
    fn prune_temp_dir(&self, path: &Path) -> io::Result<()>;
}

/// [`FileManager`] on the real filesystem, using `tempfile` for naming.
#[derive(Debug, Clone, Default)]
pub struct TempFileManager {
    root: Option<PathBuf>,
}

impl TempFileManager {
    /// Allocate under the OS temp dir.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate under `root` instead of the OS temp dir.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl FileManager for TempFileManager {
    fn create_temp_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        let root = self.root();
        std::fs::create_dir_all(&root)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(&root)?;
        // Lifetime is managed by the context lifecycle, not by drop.
        Ok(dir.keep())
    }

    fn prune_temp_dir(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
