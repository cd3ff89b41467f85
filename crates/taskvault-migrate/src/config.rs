use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskvault_core::EntityKind;

use crate::fs::FileSystem;
use crate::lock::LockOptions;
use crate::MigrationError;

/// Optional overrides, read from `<data_dir>/migration.json`. Unknown keys are
/// rejected so a typo does not silently fall back to a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MigrationConfig {
    pub todo_file: String,
    pub sessions_file: String,
    pub archive_file: String,
    pub target_file: String,
    pub state_file: String,
    pub logs_dir: String,
    pub backups_dir: String,
    pub lock_stale_ms: u64,
    pub lock_retries: u32,
    pub lock_retry_delay_ms: u64,
    /// Pre-migration snapshots kept per target; older ones are pruned.
    pub backup_retention: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            todo_file: EntityKind::Task.source_file().to_string(),
            sessions_file: EntityKind::Session.source_file().to_string(),
            archive_file: EntityKind::ArchivedTask.source_file().to_string(),
            target_file: "tasks.db".to_string(),
            state_file: "migration-state.json".to_string(),
            logs_dir: "logs".to_string(),
            backups_dir: "backups/safety".to_string(),
            lock_stale_ms: 5 * 60 * 1000,
            lock_retries: 0,
            lock_retry_delay_ms: 100,
            backup_retention: 5,
        }
    }
}

impl MigrationConfig {
    pub const FILE_NAME: &'static str = "migration.json";

    /// Load overrides from `data_dir`, or defaults when no config file exists.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the file cannot be read and
    /// [`MigrationError::Json`] when it does not parse.
    pub fn load(fs: &dyn FileSystem, data_dir: &Path) -> Result<Self, MigrationError> {
        let path = data_dir.join(Self::FILE_NAME);
        let bytes = match fs.read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(MigrationError::io("read config", &path)(err)),
        };
        serde_json::from_slice(&bytes).map_err(MigrationError::json("migration config"))
    }

    #[must_use]
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            stale_after: Duration::from_millis(self.lock_stale_ms),
            retries: self.lock_retries,
            retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
        }
    }

    #[must_use]
    pub fn layout(&self, data_dir: &Path) -> DataLayout {
        DataLayout {
            source_dir: data_dir.to_path_buf(),
            todo: self.todo_file.clone(),
            sessions: self.sessions_file.clone(),
            archive: self.archive_file.clone(),
            target: data_dir.join(&self.target_file),
            state: data_dir.join(&self.state_file),
            logs_dir: data_dir.join(&self.logs_dir),
            backups_dir: data_dir.join(&self.backups_dir),
            data_dir: data_dir.to_path_buf(),
        }
    }
}

/// Resolved locations of everything one migration touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    pub data_dir: PathBuf,
    pub source_dir: PathBuf,
    todo: String,
    sessions: String,
    archive: String,
    pub target: PathBuf,
    pub state: PathBuf,
    pub logs_dir: PathBuf,
    pub backups_dir: PathBuf,
}

impl DataLayout {
    /// Read legacy documents from `dir` instead of the data directory.
    #[must_use]
    pub fn with_source_dir(mut self, dir: &Path) -> Self {
        self.source_dir = dir.to_path_buf();
        self
    }

    #[must_use]
    pub fn source_name(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Task => &self.todo,
            EntityKind::Session => &self.sessions,
            EntityKind::ArchivedTask => &self.archive,
        }
    }

    #[must_use]
    pub fn source_path(&self, kind: EntityKind) -> PathBuf {
        self.source_dir.join(self.source_name(kind))
    }

    /// `(logical name, path)` for every legacy document, in import order.
    #[must_use]
    pub fn sources(&self) -> Vec<(&'static str, PathBuf)> {
        EntityKind::ALL.iter().map(|kind| (kind.source_file(), self.source_path(*kind))).collect()
    }
}
