use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use taskvault_core::BackupArtifact;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::fs::FileSystem;
use crate::integrity::IntegrityChecker;
use crate::MigrationError;

const SNAPSHOT_TAG: &str = ".pre-migration.";

/// Verified snapshots of the target store, kept under the backups directory
/// with the newest `retention` per target.
#[derive(Debug, Clone)]
pub struct BackupManager {
    fs: Arc<dyn FileSystem>,
    checker: IntegrityChecker,
    backups_dir: PathBuf,
    retention: usize,
}

impl BackupManager {
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>, backups_dir: PathBuf, retention: usize) -> Self {
        Self { checker: IntegrityChecker::new(Arc::clone(&fs)), fs, backups_dir, retention }
    }

    /// Copy `target` aside and confirm the copy byte-for-byte. Returns `None`
    /// when there is no target yet.
    ///
    /// # Errors
    /// Returns [`MigrationError::ChecksumMismatch`] when the copy differs from
    /// the target, and [`MigrationError::Io`] on copy failure.
    pub fn snapshot(
        &self,
        target: &Path,
        at: OffsetDateTime,
    ) -> Result<Option<BackupArtifact>, MigrationError> {
        if !self.fs.exists(target) {
            return Ok(None);
        }
        self.fs
            .create_dir_all(&self.backups_dir)
            .map_err(MigrationError::io("create backups dir", &self.backups_dir))?;

        let source_checksum = self.checker.digest(target)?;
        let path = self.unique_path(target, at);
        self.fs.copy(target, &path).map_err(MigrationError::io("copy backup", &path))?;

        let checksum = self.checker.digest(&path)?;
        if checksum != source_checksum {
            self.discard(&path);
            return Err(MigrationError::ChecksumMismatch {
                path,
                expected: source_checksum,
                actual: checksum,
            });
        }
        info!(backup = %path.display(), "target snapshot taken");

        let artifact = BackupArtifact { path, checksum, created_at: at, source_checksum };
        self.prune(target)?;
        Ok(Some(artifact))
    }

    /// `true` when the snapshot still exists with its recorded checksum.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the snapshot exists but cannot be read.
    pub fn verify(&self, artifact: &BackupArtifact) -> Result<bool, MigrationError> {
        if !self.fs.exists(&artifact.path) {
            return Ok(false);
        }
        Ok(self.checker.digest(&artifact.path)? == artifact.checksum)
    }

    /// Put the snapshot back in place of `target`. The bytes are staged
    /// beside the target and renamed over it, so `target` is never partial.
    ///
    /// # Errors
    /// Returns [`MigrationError::ChecksumMismatch`] when the snapshot or the
    /// restored copy does not match the recorded checksum.
    pub fn restore(&self, artifact: &BackupArtifact, target: &Path) -> Result<(), MigrationError> {
        self.checker.verify(&artifact.path, &artifact.checksum)?;

        let mut staged = target.as_os_str().to_owned();
        staged.push(format!(".restore.{}", OffsetDateTime::now_utc().unix_timestamp_nanos()));
        let staged = PathBuf::from(staged);
        self.fs
            .copy(&artifact.path, &staged)
            .map_err(MigrationError::io("stage restore", &staged))?;

        if let Err(err) = self.checker.verify(&staged, &artifact.checksum) {
            self.discard(&staged);
            return Err(err);
        }
        self.fs.rename(&staged, target).map_err(MigrationError::io("restore target", target))?;
        info!(backup = %artifact.path.display(), target = %target.display(), "target restored");
        Ok(())
    }

    /// Snapshots of `target`, newest first.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the backups directory cannot be listed.
    pub fn list(&self, target: &Path) -> Result<Vec<PathBuf>, MigrationError> {
        let prefix = snapshot_prefix(target);
        let mut snapshots: Vec<(i128, u32, PathBuf)> = self
            .fs
            .list_dir(&self.backups_dir)
            .map_err(MigrationError::io("list backups", &self.backups_dir))?
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name().and_then(OsStr::to_str)?;
                let stamp = name.strip_prefix(prefix.as_str())?;
                let (millis, counter) = match stamp.split_once('-') {
                    Some((millis, counter)) => {
                        (millis.parse::<i128>().ok()?, counter.parse::<u32>().ok()?)
                    }
                    None => (stamp.parse::<i128>().ok()?, 0),
                };
                Some((millis, counter, path))
            })
            .collect();
        snapshots.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        Ok(snapshots.into_iter().map(|(_, _, path)| path).collect())
    }

    fn prune(&self, target: &Path) -> Result<(), MigrationError> {
        let keep = self.retention.max(1);
        for stale in self.list(target)?.into_iter().skip(keep) {
            match self.fs.remove_file(&stale) {
                Ok(()) => info!(backup = %stale.display(), "pruned old snapshot"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(backup = %stale.display(), error = %err, "failed to prune snapshot");
                }
            }
        }
        Ok(())
    }

    /// Remove a copy that failed verification. The caller is already
    /// reporting an error, so a failed removal is only logged.
    fn discard(&self, path: &Path) {
        match self.fs.remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to remove unverified copy");
            }
        }
    }

    fn unique_path(&self, target: &Path, at: OffsetDateTime) -> PathBuf {
        let millis = at.unix_timestamp_nanos() / 1_000_000;
        let prefix = snapshot_prefix(target);
        let mut path = self.backups_dir.join(format!("{prefix}{millis}"));
        let mut counter = 1;
        while self.fs.exists(&path) {
            path = self.backups_dir.join(format!("{prefix}{millis}-{counter}"));
            counter += 1;
        }
        path
    }
}

fn snapshot_prefix(target: &Path) -> String {
    let name = target.file_name().and_then(OsStr::to_str).unwrap_or("target");
    format!("{name}{SNAPSHOT_TAG}")
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use time::Duration;

    use crate::fs::MemoryFileSystem;

    use super::*;

    fn target() -> &'static Path {
        Path::new("/data/tasks.db")
    }

    fn manager(fs: &Arc<MemoryFileSystem>, retention: usize) -> BackupManager {
        BackupManager::new(fs.clone(), PathBuf::from("/data/backups/safety"), retention)
    }

    #[test]
    fn missing_target_needs_no_snapshot() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        assert_eq!(manager(&fs, 5).snapshot(target(), OffsetDateTime::UNIX_EPOCH)?, None);
        Ok(())
    }

    #[test]
    fn snapshot_restores_original_bytes() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write(target(), b"original").map_err(MigrationError::io("write", target()))?;
        let backups = manager(&fs, 5);
        let artifact = backups
            .snapshot(target(), OffsetDateTime::UNIX_EPOCH)?
            .ok_or_else(|| MigrationError::Integrity("no snapshot".to_string()))?;
        assert_eq!(artifact.checksum, artifact.source_checksum);
        assert!(backups.verify(&artifact)?);

        fs.write(target(), b"clobbered").map_err(MigrationError::io("write", target()))?;
        backups.restore(&artifact, target())?;
        assert_eq!(fs.read(target()).map_err(MigrationError::io("read", target()))?, b"original");
        Ok(())
    }

    #[test]
    fn tampered_snapshot_is_not_restored() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write(target(), b"original").map_err(MigrationError::io("write", target()))?;
        let backups = manager(&fs, 5);
        let artifact = backups
            .snapshot(target(), OffsetDateTime::UNIX_EPOCH)?
            .ok_or_else(|| MigrationError::Integrity("no snapshot".to_string()))?;
        fs.write(&artifact.path, b"tampered")
            .map_err(MigrationError::io("write", &artifact.path))?;

        assert!(!backups.verify(&artifact)?);
        fs.write(target(), b"current").map_err(MigrationError::io("write", target()))?;
        assert!(matches!(
            backups.restore(&artifact, target()),
            Err(MigrationError::ChecksumMismatch { .. })
        ));
        assert_eq!(fs.read(target()).map_err(MigrationError::io("read", target()))?, b"current");
        Ok(())
    }

    #[test]
    fn retention_keeps_newest_snapshots() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write(target(), b"db").map_err(MigrationError::io("write", target()))?;
        let backups = manager(&fs, 2);
        let mut newest = None;
        for second in 1..=4 {
            let at = OffsetDateTime::UNIX_EPOCH + Duration::seconds(second);
            newest = backups.snapshot(target(), at)?;
        }
        let kept = backups.list(target())?;
        assert_eq!(kept.len(), 2);
        assert_eq!(Some(&kept[0]), newest.as_ref().map(|artifact| &artifact.path));
        assert!(kept[1].ends_with("tasks.db.pre-migration.3000"));
        Ok(())
    }

    /// Copies come out with an extra byte and nothing can be deleted.
    #[derive(Debug, Default)]
    struct LossyCopies {
        inner: MemoryFileSystem,
    }

    impl FileSystem for LossyCopies {
        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.inner.read(path)
        }
        fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            self.inner.write(path, contents)
        }
        fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            self.inner.create_new(path, contents)
        }
        fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            self.inner.append(path, contents)
        }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            self.inner.rename(from, to)
        }
        fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
            let mut bytes = self.inner.read(from)?;
            bytes.push(b'!');
            self.inner.write(to, &bytes)?;
            Ok(bytes.len() as u64)
        }
        fn remove_file(&self, _path: &Path) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            self.inner.create_dir_all(path)
        }
        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }
        fn modified(&self, path: &Path) -> io::Result<SystemTime> {
            self.inner.modified(path)
        }
        fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
            self.inner.list_dir(path)
        }
        fn device_id(&self, path: &Path) -> io::Result<Option<u64>> {
            self.inner.device_id(path)
        }
    }

    #[test]
    fn undeletable_bad_copy_still_reports_the_mismatch() -> Result<(), MigrationError> {
        let lossy = Arc::new(LossyCopies::default());
        lossy.write(target(), b"original").map_err(MigrationError::io("write", target()))?;
        let backups =
            BackupManager::new(lossy.clone(), PathBuf::from("/data/backups/safety"), 5);

        assert!(matches!(
            backups.snapshot(target(), OffsetDateTime::UNIX_EPOCH),
            Err(MigrationError::ChecksumMismatch { .. })
        ));

        let checksum = backups.checker.digest(target())?;
        let artifact = BackupArtifact {
            path: target().to_path_buf(),
            checksum: checksum.clone(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            source_checksum: checksum,
        };
        assert!(matches!(
            backups.restore(&artifact, target()),
            Err(MigrationError::ChecksumMismatch { .. })
        ));
        assert_eq!(
            lossy.read(target()).map_err(MigrationError::io("read", target()))?,
            b"original"
        );
        Ok(())
    }
}
