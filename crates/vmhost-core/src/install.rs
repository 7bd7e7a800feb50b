//! Installation step run before an engine starts.
//!
//! Engines usually expect their standard library or application files on
//! disk. An [`Installer`] materializes them; a failure aborts the start.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use vmhost_common::VmError;

/// Materializes whatever an engine needs on disk.
pub trait Installer: Send + Sync {
    /// Run the installation.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InstallFailed`] when the files cannot be written.
    fn install(&self) -> Result<(), VmError>;
}

/// Installer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInstall;

impl Installer for NoInstall {
    fn install(&self) -> Result<(), VmError> {
        Ok(())
    }
}

/// Installer creating a directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryInstaller {
    root: PathBuf,
}

impl DirectoryInstaller {
    /// Install into `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Installer for DirectoryInstaller {
    fn install(&self) -> Result<(), VmError> {
        fs::create_dir_all(&self.root).map_err(|source| VmError::InstallFailed {
            path: self.root.display().to_string(),
            source,
        })?;
        debug!(root = %self.root.display(), "Install directory ready");
        Ok(())
    }
}

/// The installer implied by an optional install directory.
pub fn for_dir(install_dir: Option<&Path>) -> Box<dyn Installer> {
    match install_dir {
        Some(dir) => Box::new(DirectoryInstaller::new(dir)),
        None => Box::new(NoInstall),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_nested_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("a").join("b");

        let installer = DirectoryInstaller::new(&root);
        installer.install().unwrap();
        assert!(root.is_dir());

        // Already present is fine.
        installer.install().unwrap();
    }

    #[test]
    fn test_failure_is_install_failed() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let root = tmp.path().join("below-a-file");

        let err = DirectoryInstaller::new(&root).install().unwrap_err();
        assert!(matches!(err, VmError::InstallFailed { .. }));
        assert_eq!(err.code().as_i32(), -11);
    }

    #[test]
    fn test_for_dir() {
        assert!(for_dir(None).install().is_ok());
    }
}
