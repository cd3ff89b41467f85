//! Advisory lock serializing migrations against one target. The lock is a
//! marker file created exclusively beside the target; a marker older than the
//! stale threshold is moved aside and the lock re-attempted.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::fs::FileSystem;
use crate::MigrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub stale_after: Duration,
    /// Extra attempts after the first one finds the lock held.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            retries: 0,
            retry_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockMarker {
    pub token: String,
    pub pid: u32,
    pub operation: String,
    #[serde(with = "time::serde::rfc3339")]
    pub acquired_at: OffsetDateTime,
}

/// Marker path for `target`: the target path with `.lock` appended.
#[must_use]
pub fn marker_path(target: &Path) -> PathBuf {
    let mut path: OsString = target.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

#[derive(Debug, Clone)]
pub struct AdvisoryLocker {
    fs: Arc<dyn FileSystem>,
}

impl AdvisoryLocker {
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Take the lock on `target` for `operation`.
    ///
    /// # Errors
    /// Returns [`MigrationError::Lock`] when a live marker is still present
    /// after `options.retries` further attempts, and [`MigrationError::Io`]
    /// when the marker cannot be written or moved aside.
    pub fn acquire(
        &self,
        target: &Path,
        operation: &str,
        options: LockOptions,
    ) -> Result<LockHandle, MigrationError> {
        let path = marker_path(target);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            self.fs.create_dir_all(parent).map_err(MigrationError::io("create lock dir", parent))?;
        }

        let marker = LockMarker {
            token: Ulid::new().to_string(),
            pid: std::process::id(),
            operation: operation.to_string(),
            acquired_at: OffsetDateTime::now_utc(),
        };
        let bytes =
            serde_json::to_vec_pretty(&marker).map_err(MigrationError::json("lock marker"))?;

        let mut attempts = 0;
        loop {
            match self.fs.create_new(&path, &bytes) {
                Ok(()) => {
                    debug!(path = %path.display(), token = %marker.token, "lock acquired");
                    return Ok(LockHandle {
                        fs: Arc::clone(&self.fs),
                        path,
                        token: marker.token,
                        released: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(MigrationError::io("create lock marker", &path)(err)),
            }

            let age = match self.fs.modified(&path) {
                Ok(modified) => SystemTime::now().duration_since(modified).unwrap_or_default(),
                // Released between our attempt and the probe.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(MigrationError::io("inspect lock marker", &path)(err)),
            };

            if age >= options.stale_after {
                self.archive_stale(&path, age)?;
                continue;
            }

            if attempts >= options.retries {
                return Err(MigrationError::Lock(self.describe_holder(&path)));
            }
            attempts += 1;
            thread::sleep(options.retry_delay);
        }
    }

    fn archive_stale(&self, path: &Path, age: Duration) -> Result<(), MigrationError> {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let mut archived: OsString = path.as_os_str().to_owned();
        archived.push(format!(".stale.{millis}"));
        let archived = PathBuf::from(archived);

        match self.fs.rename(path, &archived) {
            Ok(()) => {
                warn!(
                    marker = %path.display(),
                    archived = %archived.display(),
                    age_secs = age.as_secs(),
                    "reclaimed stale migration lock"
                );
                Ok(())
            }
            // Another contender reclaimed it first.
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MigrationError::io("archive stale lock", path)(err)),
        }
    }

    fn describe_holder(&self, path: &Path) -> String {
        let holder = self
            .fs
            .read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockMarker>(&bytes).ok());
        match holder {
            Some(marker) => format!(
                "migration lock held by pid {} ({}) since {}; marker {}",
                marker.pid,
                marker.operation,
                marker
                    .acquired_at
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default(),
                path.display()
            ),
            None => format!("migration lock held by an unknown holder; marker {}", path.display()),
        }
    }
}

/// Held lock. Released on [`LockHandle::release`] or when dropped.
#[derive(Debug)]
pub struct LockHandle {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockHandle {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Remove the marker if it still carries this handle's token. A marker
    /// that was reclaimed and re-taken by another run is left alone.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the marker cannot be removed.
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), MigrationError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let current = match self.fs.read(&self.path) {
            Ok(bytes) => serde_json::from_slice::<LockMarker>(&bytes).ok(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(MigrationError::io("read lock marker", &self.path)(err)),
        };
        if current.as_ref().map(|marker| marker.token.as_str()) != Some(self.token.as_str()) {
            warn!(marker = %self.path.display(), "lock marker belongs to another holder; leaving it");
            return Ok(());
        }

        match self.fs.remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "lock released");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MigrationError::io("remove lock marker", &self.path)(err)),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(error = %err, "failed to release migration lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::MemoryFileSystem;

    use super::*;

    fn target() -> &'static Path {
        Path::new("/data/tasks.db")
    }

    #[test]
    fn second_acquire_fails_while_held() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        let locker = AdvisoryLocker::new(fs.clone());
        let held = locker.acquire(target(), "migrate", LockOptions::default())?;

        let err = locker.acquire(target(), "migrate", LockOptions::default());
        let message = err.err().map(|err| err.to_string()).unwrap_or_default();
        assert!(message.contains("lock"), "{message}");
        assert!(message.contains("held"), "{message}");

        held.release()?;
        let again = locker.acquire(target(), "migrate", LockOptions::default())?;
        assert_eq!(again.path(), Path::new("/data/tasks.db.lock"));
        Ok(())
    }

    #[test]
    fn stale_marker_is_archived_and_replaced() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        let locker = AdvisoryLocker::new(fs.clone());
        let abandoned = locker.acquire(target(), "migrate", LockOptions::default())?;
        std::mem::forget(abandoned);

        let marker = marker_path(target());
        fs.set_modified(&marker, SystemTime::now() - Duration::from_secs(600))
            .map_err(MigrationError::io("backdate", &marker))?;

        let handle = locker.acquire(target(), "migrate", LockOptions::default())?;
        let archived = fs
            .list_dir(Path::new("/data"))
            .map_err(MigrationError::io("list", Path::new("/data")))?
            .into_iter()
            .filter(|path| path.to_string_lossy().contains("tasks.db.lock.stale."))
            .count();
        assert_eq!(archived, 1);
        drop(handle);
        assert!(!fs.exists(&marker));
        Ok(())
    }

    #[test]
    fn release_is_idempotent_and_respects_foreign_markers() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        let locker = AdvisoryLocker::new(fs.clone());
        let mut handle = locker.acquire(target(), "migrate", LockOptions::default())?;
        let marker = marker_path(target());

        let foreign = LockMarker {
            token: "someone-else".to_string(),
            pid: 1,
            operation: "migrate".to_string(),
            acquired_at: OffsetDateTime::now_utc(),
        };
        let bytes = serde_json::to_vec(&foreign).map_err(MigrationError::json("marker"))?;
        fs.write(&marker, &bytes).map_err(MigrationError::io("write", &marker))?;

        handle.release_inner()?;
        handle.release_inner()?;
        assert!(fs.exists(&marker), "foreign marker must survive release");
        Ok(())
    }

    #[test]
    fn retries_wait_for_release() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        let locker = AdvisoryLocker::new(fs.clone());
        let held = locker.acquire(target(), "migrate", LockOptions::default())?;

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        let options = LockOptions {
            retries: 50,
            retry_delay: Duration::from_millis(10),
            ..LockOptions::default()
        };
        let handle = locker.acquire(target(), "migrate", options)?;
        assert!(!handle.token().is_empty());
        releaser.join().map_err(|_| MigrationError::Lock("releaser panicked".to_string()))?;
        Ok(())
    }
}
