//! Stage-then-rename publication of a new target store. The staging file
//! always lives on the target's filesystem so the final rename is atomic;
//! when that cannot be guaranteed the swap is refused rather than degraded
//! to copy-and-delete.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::fs::FileSystem;
use crate::MigrationError;

const STAGING_TAG: &str = ".staging.";

#[cfg(unix)]
const CROSS_DEVICE: i32 = 18;

fn is_cross_device(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(CROSS_DEVICE)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[derive(Debug, Clone)]
pub struct AtomicSwapper {
    fs: Arc<dyn FileSystem>,
}

impl AtomicSwapper {
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Fresh staging path beside `target`. Nothing is created.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the target directory cannot be created.
    pub fn stage_new_store(&self, target: &Path) -> Result<PathBuf, MigrationError> {
        let dir = parent_dir(target);
        self.fs.create_dir_all(dir).map_err(MigrationError::io("create target dir", dir))?;
        let nonce = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let mut path: OsString = target.as_os_str().to_owned();
        path.push(format!("{STAGING_TAG}{nonce}"));
        Ok(PathBuf::from(path))
    }

    /// Check that `staging` can be renamed onto `target` atomically. Both
    /// parents must exist.
    ///
    /// # Errors
    /// Returns [`MigrationError::AtomicityUnsupported`] when the two paths are
    /// on different filesystems.
    pub fn ensure_same_filesystem(
        &self,
        staging: &Path,
        target: &Path,
    ) -> Result<(), MigrationError> {
        let staging_dir = parent_dir(staging);
        let target_dir = parent_dir(target);
        let staging_dev = self
            .fs
            .device_id(staging_dir)
            .map_err(MigrationError::io("stat staging dir", staging_dir))?;
        let target_dev = self
            .fs
            .device_id(target_dir)
            .map_err(MigrationError::io("stat target dir", target_dir))?;
        match (staging_dev, target_dev) {
            (Some(a), Some(b)) if a != b => Err(MigrationError::AtomicityUnsupported(format!(
                "staging {} and target {} are on different filesystems",
                staging.display(),
                target.display()
            ))),
            _ => Ok(()),
        }
    }

    /// Atomically replace `target` with `staging`.
    ///
    /// # Errors
    /// Returns [`MigrationError::AtomicityUnsupported`] for a cross-device
    /// pair and [`MigrationError::Io`] for any other rename failure. In both
    /// cases `target` is unchanged.
    pub fn publish(&self, staging: &Path, target: &Path) -> Result<(), MigrationError> {
        self.ensure_same_filesystem(staging, target)?;
        match self.fs.rename(staging, target) {
            Ok(()) => {
                info!(staging = %staging.display(), target = %target.display(), "target published");
                Ok(())
            }
            Err(err) if is_cross_device(&err) => Err(MigrationError::AtomicityUnsupported(format!(
                "rename {} -> {} crossed filesystems",
                staging.display(),
                target.display()
            ))),
            Err(err) => Err(MigrationError::io("publish target", target)(err)),
        }
    }

    /// Remove a staging file if it exists.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the file exists but cannot be removed.
    pub fn discard(&self, staging: &Path) -> Result<(), MigrationError> {
        match self.fs.remove_file(staging) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MigrationError::io("discard staging", staging)(err)),
        }
    }

    /// Remove staging files left beside `target` by interrupted runs.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the target directory cannot be listed.
    pub fn cleanup_orphans(&self, target: &Path) -> Result<Vec<PathBuf>, MigrationError> {
        let dir = parent_dir(target);
        let Some(name) = target.file_name().and_then(OsStr::to_str) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{name}{STAGING_TAG}");
        let mut removed = Vec::new();
        for path in self.fs.list_dir(dir).map_err(MigrationError::io("list target dir", dir))? {
            let is_orphan = path
                .file_name()
                .and_then(OsStr::to_str)
                .is_some_and(|file| file.starts_with(&prefix));
            if !is_orphan {
                continue;
            }
            match self.fs.remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed orphaned staging store");
                    removed.push(path);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove staging store");
                }
            }
        }
        Ok(removed)
    }
}
