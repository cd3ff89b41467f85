//! One-shot migration of the legacy JSON task documents (`todo.json`,
//! `sessions.json`, `todo-archive.json`) into the SQLite task store.
//!
//! A run is a persisted phase machine guarded by an advisory lock. The new
//! store is built in a staging file beside the target, verified, and
//! published with a single rename; a pre-run snapshot is restored if anything
//! fails after that rename.

mod audit;
mod backup;
mod config;
mod error;
mod fs;
mod import;
mod integrity;
mod lock;
mod orchestrator;
mod state;
mod swap;

use std::path::Path;

pub use audit::{latest_log, read_log, AuditLogger};
pub use backup::BackupManager;
pub use config::{DataLayout, MigrationConfig};
pub use error::MigrationError;
pub use fs::{FileSystem, MemoryFileSystem, OsFileSystem};
pub use import::{
    archived_row, load_sources, session_row, task_row, ImportReport, Importer, SourceSet,
};
pub use integrity::{digest_bytes, FileIntegrity, IntegrityChecker, SourceIntegrityReport};
pub use lock::{marker_path, AdvisoryLocker, LockHandle, LockMarker, LockOptions};
pub use orchestrator::{MigrateOptions, MigrationResult, Migrator, TargetReport};
pub use state::{ResumeStatus, StateStore};
pub use swap::AtomicSwapper;

use taskvault_core::{MigrationState, SourceCounts};

/// Migrate the documents in `data_dir` into its target store.
///
/// A config that cannot be loaded is reported as a failed result.
#[must_use]
pub fn migrate(data_dir: &Path, options: MigrateOptions) -> MigrationResult {
    match Migrator::open(data_dir) {
        Ok(migrator) => migrator.migrate(options),
        Err(err) => MigrationResult::from_error(options.dry_run, &err, None),
    }
}

/// Migrate documents from `source_dir` into the store under `data_dir`,
/// staging the new store at `staging` when given.
#[must_use]
pub fn migrate_atomic(
    data_dir: &Path,
    source_dir: &Path,
    staging: Option<&Path>,
    options: MigrateOptions,
) -> MigrationResult {
    match Migrator::open(data_dir) {
        Ok(migrator) => migrator.migrate_atomic(source_dir, staging, options),
        Err(err) => MigrationResult::from_error(options.dry_run, &err, None),
    }
}

/// Record counts of the documents in `source_dir`. Never opens the target.
///
/// # Errors
/// Returns [`MigrationError::Parse`] when a document is malformed.
pub fn count_source_records(source_dir: &Path) -> Result<SourceCounts, MigrationError> {
    let fs = OsFileSystem;
    let layout = MigrationConfig::load(&fs, source_dir)?.layout(source_dir);
    import::count_source_records(&fs, &layout)
}

/// # Errors
/// Returns [`MigrationError`] when the config or state file is unreadable.
pub fn load_migration_state(data_dir: &Path) -> Result<Option<MigrationState>, MigrationError> {
    Migrator::open(data_dir)?.load_state()
}

/// # Errors
/// Returns [`MigrationError`] when the state or a source cannot be read.
pub fn can_resume_migration(data_dir: &Path) -> Result<ResumeStatus, MigrationError> {
    Migrator::open(data_dir)?.can_resume()
}

/// # Errors
/// Returns [`MigrationError`] when the state or a source cannot be read.
pub fn verify_source_integrity(
    data_dir: &Path,
) -> Result<Option<SourceIntegrityReport>, MigrationError> {
    Migrator::open(data_dir)?.verify_source_integrity()
}
