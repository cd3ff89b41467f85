//! The migration phase machine: init, backup, validate, import, verify,
//! cleanup, complete. The live target is replaced in exactly one step, the
//! rename at the end of `verify`; any failure after that step restores the
//! pre-run target before the result is returned.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use taskvault_core::{
    BackupArtifact, EntityKind, LogEntry, MigrationPhase, MigrationState, ProgressDelta,
    SourceCounts, SourceFile,
};
use taskvault_store_sqlite::{IntegrityReport, TaskStore};
use time::OffsetDateTime;
use tracing::warn;

use crate::audit::{latest_log, AuditLogger};
use crate::backup::BackupManager;
use crate::config::{DataLayout, MigrationConfig};
use crate::fs::{FileSystem, OsFileSystem};
use crate::import::{load_sources, Importer, SourceSet};
use crate::integrity::{IntegrityChecker, SourceIntegrityReport};
use crate::lock::AdvisoryLocker;
use crate::state::{ResumeStatus, StateStore};
use crate::swap::AtomicSwapper;
use crate::MigrationError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Re-import over a target that already holds migrated data, and discard
    /// an unfinished run that cannot be resumed.
    pub force: bool,
    /// Checksum, parse and order the sources without writing anything.
    pub dry_run: bool,
}

/// Outcome of one migration call. Failures are reported here rather than as
/// an `Err`, so callers always get the warnings, errors and log location.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub success: bool,
    pub dry_run: bool,
    pub phase: MigrationPhase,
    pub tasks_imported: u64,
    pub sessions_imported: u64,
    pub archived_imported: u64,
    pub source_counts: SourceCounts,
    pub skipped: bool,
    pub resumed: bool,
    pub restored: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl MigrationResult {
    /// A failed result for an error raised before any state was recorded.
    #[must_use]
    pub fn from_error(dry_run: bool, err: &MigrationError, log_path: Option<PathBuf>) -> Self {
        Self {
            errors: vec![err.to_string()],
            error_kind: Some(err.kind()),
            log_path,
            ..Self::empty(dry_run, MigrationPhase::Failed)
        }
    }

    fn empty(dry_run: bool, phase: MigrationPhase) -> Self {
        Self {
            success: false,
            dry_run,
            phase,
            tasks_imported: 0,
            sessions_imported: 0,
            archived_imported: 0,
            source_counts: SourceCounts::default(),
            skipped: false,
            resumed: false,
            restored: false,
            warnings: Vec::new(),
            errors: Vec::new(),
            error_kind: None,
            backup: None,
            log_path: None,
        }
    }
}

/// Health of the live target store, as reported by `verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReport {
    pub path: PathBuf,
    pub exists: bool,
    pub counts: SourceCounts,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityReport>,
}

#[derive(Debug, Clone)]
pub struct Migrator {
    fs: Arc<dyn FileSystem>,
    config: MigrationConfig,
    layout: DataLayout,
}

impl Migrator {
    /// Migrator for `data_dir`, honouring `migration.json` when present.
    ///
    /// # Errors
    /// Returns [`MigrationError`] when the config file is unreadable or invalid.
    pub fn open(data_dir: &Path) -> Result<Self, MigrationError> {
        let fs: Arc<dyn FileSystem> = Arc::new(OsFileSystem);
        let config = MigrationConfig::load(fs.as_ref(), data_dir)?;
        Ok(Self::with_config(data_dir, config).with_fs(fs))
    }

    #[must_use]
    pub fn with_config(data_dir: &Path, config: MigrationConfig) -> Self {
        let layout = config.layout(data_dir);
        Self { fs: Arc::new(OsFileSystem), config, layout }
    }

    /// Route all non-database file access through `fs`.
    #[must_use]
    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    #[must_use]
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Migrate the legacy documents in the data directory into the target store.
    #[must_use]
    pub fn migrate(&self, options: MigrateOptions) -> MigrationResult {
        self.run(self.layout.clone(), None, "migrate", options)
    }

    /// Migrate documents from `source_dir`, building the new store at
    /// `staging` (or a fresh path beside the target) before the swap.
    #[must_use]
    pub fn migrate_atomic(
        &self,
        source_dir: &Path,
        staging: Option<&Path>,
        options: MigrateOptions,
    ) -> MigrationResult {
        let layout = self.layout.clone().with_source_dir(source_dir);
        self.run(layout, staging.map(Path::to_path_buf), "migrate-atomic", options)
    }

    /// # Errors
    /// Returns [`MigrationError::Parse`] when a source document is malformed.
    pub fn count_source_records(&self) -> Result<SourceCounts, MigrationError> {
        crate::import::count_source_records(self.fs.as_ref(), &self.layout)
    }

    /// # Errors
    /// Returns [`MigrationError`] when the state file is unreadable.
    pub fn load_state(&self) -> Result<Option<MigrationState>, MigrationError> {
        self.state_store().load()
    }

    /// # Errors
    /// Returns [`MigrationError`] when the state or a source cannot be read.
    pub fn can_resume(&self) -> Result<ResumeStatus, MigrationError> {
        self.state_store().can_resume(&self.checker(), &self.layout.sources())
    }

    /// Compare the sources on disk with the checksums of the recorded run.
    /// `None` when no run has been recorded.
    ///
    /// # Errors
    /// Returns [`MigrationError`] when the state or a source cannot be read.
    pub fn verify_source_integrity(&self) -> Result<Option<SourceIntegrityReport>, MigrationError> {
        let Some(state) = self.load_state()? else {
            return Ok(None);
        };
        self.checker().check_sources(&state.source_files, &self.layout.sources()).map(Some)
    }

    /// Row counts and integrity of the live target store.
    ///
    /// # Errors
    /// Returns [`MigrationError::Store`] when the target cannot be opened or probed.
    pub fn verify_target(&self) -> Result<TargetReport, MigrationError> {
        let path = self.layout.target.clone();
        if !self.fs.exists(&path) {
            return Ok(TargetReport {
                path,
                exists: false,
                counts: SourceCounts::default(),
                healthy: false,
                integrity: None,
            });
        }
        let store = TaskStore::open_read_only(&path)?;
        let mut counts = SourceCounts::default();
        for kind in EntityKind::ALL {
            counts.set(kind, store.count(kind)?);
        }
        let integrity = store.integrity_check()?;
        store.close()?;
        Ok(TargetReport {
            path,
            exists: true,
            counts,
            healthy: integrity.is_healthy(),
            integrity: Some(integrity),
        })
    }

    /// Newest audit log, if any run has been logged.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the logs directory cannot be listed.
    pub fn latest_log(&self) -> Result<Option<PathBuf>, MigrationError> {
        latest_log(self.fs.as_ref(), &self.layout.logs_dir)
    }

    /// # Errors
    /// Returns [`MigrationError`] when the log cannot be read or parsed.
    pub fn read_log(&self, path: &Path) -> Result<Vec<LogEntry>, MigrationError> {
        crate::audit::read_log(self.fs.as_ref(), path)
    }

    fn state_store(&self) -> StateStore {
        StateStore::new(Arc::clone(&self.fs), self.layout.state.clone())
    }

    fn checker(&self) -> IntegrityChecker {
        IntegrityChecker::new(Arc::clone(&self.fs))
    }

    fn run(
        &self,
        layout: DataLayout,
        staging: Option<PathBuf>,
        operation: &str,
        options: MigrateOptions,
    ) -> MigrationResult {
        let started_at = OffsetDateTime::now_utc();
        let created = AuditLogger::create(Arc::clone(&self.fs), &layout.logs_dir, started_at);
        let mut audit = match created {
            Ok(audit) => audit,
            Err(err) => return MigrationResult::from_error(options.dry_run, &err, None),
        };
        audit.info(
            operation,
            format!(
                "{operation} from {} into {} (force: {}, dry run: {})",
                layout.source_dir.display(),
                layout.target.display(),
                options.force,
                options.dry_run
            ),
        );

        if options.dry_run {
            return self.preview(&layout, options.force, audit);
        }

        let locker = AdvisoryLocker::new(Arc::clone(&self.fs));
        let lock = match locker.acquire(&layout.target, operation, self.config.lock_options()) {
            Ok(lock) => lock,
            Err(err) => {
                audit.error("lock", err.to_string());
                let log_path = flush_log(&mut audit);
                return MigrationResult::from_error(false, &err, log_path);
            }
        };

        let mut run = Run::new(self, layout, staging, options.force, audit);
        let outcome = run.execute(started_at);
        let result = match outcome {
            Ok(()) => run.succeed(),
            Err(err) => run.fail(err),
        };
        if let Err(err) = lock.release() {
            warn!(error = %err, "failed to release migration lock");
        }
        result
    }

    fn preview(&self, layout: &DataLayout, force: bool, mut audit: AuditLogger) -> MigrationResult {
        match self.preview_counts(layout, force, &mut audit) {
            Ok((counts, warnings)) => {
                audit.info(
                    "dry-run",
                    format!(
                        "would import {} task(s), {} session(s), {} archived task(s)",
                        counts.tasks, counts.sessions, counts.archived
                    ),
                );
                let log_path = flush_log(&mut audit);
                MigrationResult {
                    success: true,
                    source_counts: counts,
                    warnings,
                    log_path,
                    ..MigrationResult::empty(true, MigrationPhase::Validate)
                }
            }
            Err(err) => {
                audit.error(err.kind(), err.to_string());
                let log_path = flush_log(&mut audit);
                MigrationResult::from_error(true, &err, log_path)
            }
        }
    }

    fn preview_counts(
        &self,
        layout: &DataLayout,
        force: bool,
        audit: &mut AuditLogger,
    ) -> Result<(SourceCounts, Vec<String>), MigrationError> {
        let checker = self.checker();
        let mut warnings = Vec::new();
        for (name, path) in layout.sources() {
            if self.fs.exists(&path) {
                let file = checker.describe(&path)?;
                audit.info("checksum", describe_source(name, &file));
            } else {
                warnings.push(missing_source_warning(name, &layout.source_dir));
            }
        }

        let sources = load_sources(self.fs.as_ref(), layout)?;
        let counts = sources.counts();
        sources.into_ordered()?;

        if self.fs.exists(&layout.target) {
            let store = TaskStore::open_read_only(&layout.target)?;
            let existing = store.count(EntityKind::Task)?;
            store.close()?;
            if existing > 0 && counts.tasks == 0 {
                warnings.push(format!(
                    "task source is empty but the target holds {existing} task(s); \
                     a real run would refuse without force"
                ));
            } else if existing > 0 && !force {
                warnings.push(format!(
                    "target store already contains migrated data ({existing} task(s)); \
                     a real run would skip the import"
                ));
            }
        }
        for warning in &warnings {
            audit.warn("dry-run", warning.clone());
        }
        Ok((counts, warnings))
    }
}

fn describe_source(name: &str, file: &SourceFile) -> String {
    format!("{name}: sha256 {} ({} bytes)", file.checksum, file.size)
}

fn missing_source_warning(name: &str, dir: &Path) -> String {
    format!("{name} not found in {}; treating it as empty", dir.display())
}

fn flush_log(audit: &mut AuditLogger) -> Option<PathBuf> {
    if let Err(err) = audit.flush() {
        warn!(error = %err, "failed to write migration log");
    }
    Some(audit.path().to_path_buf())
}

/// One locked migration attempt.
struct Run {
    fs: Arc<dyn FileSystem>,
    layout: DataLayout,
    audit: AuditLogger,
    states: StateStore,
    checker: IntegrityChecker,
    backups: BackupManager,
    swapper: AtomicSwapper,
    force: bool,
    requested_staging: Option<PathBuf>,
    state: Option<MigrationState>,
    staging: Option<PathBuf>,
    published: bool,
    resumed: bool,
    restored: bool,
}

impl Run {
    fn new(
        migrator: &Migrator,
        layout: DataLayout,
        requested_staging: Option<PathBuf>,
        force: bool,
        audit: AuditLogger,
    ) -> Self {
        let fs = Arc::clone(&migrator.fs);
        Self {
            states: StateStore::new(Arc::clone(&fs), layout.state.clone()),
            checker: IntegrityChecker::new(Arc::clone(&fs)),
            backups: BackupManager::new(
                Arc::clone(&fs),
                layout.backups_dir.clone(),
                migrator.config.backup_retention,
            ),
            swapper: AtomicSwapper::new(Arc::clone(&fs)),
            fs,
            layout,
            audit,
            force,
            requested_staging,
            state: None,
            staging: None,
            published: false,
            resumed: false,
            restored: false,
        }
    }

    fn execute(&mut self, started_at: OffsetDateTime) -> Result<(), MigrationError> {
        let mut state = self.init(started_at)?;
        let outcome = self.phases(&mut state);
        self.state = Some(state);
        outcome
    }

    fn init(&mut self, started_at: OffsetDateTime) -> Result<MigrationState, MigrationError> {
        if let Some(previous) = self.states.load()?.filter(MigrationState::is_active) {
            if previous.phase == MigrationPhase::Cleanup {
                self.resumed = true;
                self.audit.warn("init", "finishing a run interrupted during cleanup");
                return Ok(previous);
            }
            if previous.phase != MigrationPhase::Init {
                let status = self.states.can_resume(&self.checker, &self.layout.sources())?;
                if status.can_resume {
                    return self.resume(previous);
                }
                if !self.force {
                    return Err(MigrationError::StateConflict {
                        phase: previous.phase,
                        reason: status.reason.unwrap_or_else(|| "resume refused".to_string()),
                    });
                }
                self.audit.warn(
                    "init",
                    format!("discarding unfinished run at phase {} (forced)", previous.phase),
                );
            }
        }

        let mut state = self.states.create(started_at, true)?;
        state.forced = self.force;
        for (name, path) in self.layout.sources() {
            if self.fs.exists(&path) {
                let file = self.checker.describe(&path)?;
                self.audit.info("checksum", describe_source(name, &file));
                state.source_files.insert(name.to_string(), file);
            } else {
                let message = missing_source_warning(name, &self.layout.source_dir);
                self.audit.warn("init", message.clone());
                state.add_warning(message);
            }
        }
        self.states.save(&state)?;
        Ok(state)
    }

    /// Undo anything the interrupted run may have done to the live target,
    /// then let the phases run again from the top. Only `verify` publishes,
    /// so earlier phases never touched the target.
    fn resume(&mut self, mut state: MigrationState) -> Result<MigrationState, MigrationError> {
        self.resumed = true;
        let message = format!("resuming interrupted migration from phase {}", state.phase);
        self.audit.warn("init", message.clone());
        self.states.add_warning(&mut state, message)?;
        if state.forced {
            self.force = true;
            self.audit.info("init", "resumed run was forced; replacing migrated data");
        } else if self.force {
            state.forced = true;
            self.states.save(&state)?;
        }

        if state.phase == MigrationPhase::Verify {
            let target = self.layout.target.clone();
            match state.backup.clone() {
                Some(artifact) => {
                    let unchanged = self.fs.exists(&target)
                        && self.checker.digest(&target)? == artifact.source_checksum;
                    if !unchanged {
                        self.backups.restore(&artifact, &target)?;
                        self.audit.warn("init", "restored target from snapshot before resuming");
                    }
                }
                None if self.fs.exists(&target) => {
                    self.fs
                        .remove_file(&target)
                        .map_err(MigrationError::io("remove target", &target))?;
                    self.audit.warn("init", "removed target published by the interrupted run");
                }
                None => {}
            }
        }
        Ok(state)
    }

    /// Advance the persisted phase (a resumed run may already be past it) and
    /// open a new audit section.
    fn enter(
        &mut self,
        state: &mut MigrationState,
        phase: MigrationPhase,
    ) -> Result<(), MigrationError> {
        if state.phase.can_transition_to(phase) {
            self.states.advance_phase(state, phase)?;
        }
        self.audit.enter_phase(phase)
    }

    fn phases(&mut self, state: &mut MigrationState) -> Result<(), MigrationError> {
        if state.phase != MigrationPhase::Cleanup {
            self.backup(state)?;
            let sources = self.validate(state)?;
            let totals = sources.counts();
            if let Some(staging) = self.import(state, sources)? {
                self.verify(state, &staging, totals)?;
            }
        }
        self.cleanup(state)?;

        state.complete(OffsetDateTime::now_utc())?;
        self.states.save(state)?;
        self.audit.enter_phase(MigrationPhase::Complete)?;
        self.audit.info("complete", "migration complete");
        Ok(())
    }

    fn backup(&mut self, state: &mut MigrationState) -> Result<(), MigrationError> {
        self.enter(state, MigrationPhase::Backup)?;
        match state.backup.clone() {
            Some(artifact) => {
                if !self.backups.verify(&artifact)? {
                    let actual = if self.fs.exists(&artifact.path) {
                        self.checker.digest(&artifact.path)?
                    } else {
                        "<absent>".to_string()
                    };
                    return Err(MigrationError::ChecksumMismatch {
                        path: artifact.path,
                        expected: artifact.checksum,
                        actual,
                    });
                }
                let message = format!("reusing verified snapshot {}", artifact.path.display());
                self.audit.info("backup", message);
            }
            None => match self.backups.snapshot(&self.layout.target, OffsetDateTime::now_utc())? {
                Some(artifact) => {
                    let message = format!("snapshot written to {}", artifact.path.display());
                    self.audit.info("backup", message);
                    state.backup = Some(artifact);
                    self.states.save(state)?;
                }
                None => self.audit.info("backup", "no existing target; nothing to back up"),
            },
        }
        Ok(())
    }

    fn validate(&mut self, state: &mut MigrationState) -> Result<SourceSet, MigrationError> {
        self.enter(state, MigrationPhase::Validate)?;
        self.checker.check_sources(&state.source_files, &self.layout.sources())?.into_result()?;

        let sources = load_sources(self.fs.as_ref(), &self.layout)?;
        let totals = sources.counts();
        self.states.record_progress(state, &ProgressDelta::totals(totals))?;
        self.audit.info(
            "validate",
            format!(
                "parsed {} task(s), {} session(s), {} archived task(s)",
                totals.tasks, totals.sessions, totals.archived
            ),
        );
        Ok(sources)
    }

    /// Build the new store in staging. Returns the staging path, or `None`
    /// when the import was skipped because the target is already migrated.
    fn import(
        &mut self,
        state: &mut MigrationState,
        sources: SourceSet,
    ) -> Result<Option<PathBuf>, MigrationError> {
        self.enter(state, MigrationPhase::Import)?;
        let sources = sources.into_ordered()?;
        let staging = self.prepare_staging()?;

        let mut store = TaskStore::open(&staging)?;
        let states = self.states.clone();
        let report = Importer::new(self.force).import(&sources, &mut store, |kind, rows| {
            let mut delta = ProgressDelta::default();
            match kind {
                EntityKind::Task => delta.tasks_imported = Some(rows),
                EntityKind::Session => delta.sessions_imported = Some(rows),
                EntityKind::ArchivedTask => delta.archived_imported = Some(rows),
            }
            states.record_progress(state, &delta)
        })?;
        store.close()?;

        for warning in &report.warnings {
            self.audit.warn("import", warning.clone());
            state.add_warning(warning.clone());
        }
        self.states.save(state)?;

        if let Some(risk) = report.data_loss_risk.filter(|_| !self.force) {
            return Err(MigrationError::DataLossRisk(risk));
        }
        if let Some(reason) = report.skipped_reason {
            let totals = sources.counts();
            let message = format!(
                "count mismatch: {} task(s), {} session(s), {} archived task(s) in sources, \
                 none imported",
                totals.tasks, totals.sessions, totals.archived
            );
            self.audit.warn("import", message.clone());
            state.add_warning(message);
            state.skipped_reason = Some(reason);
            self.states.save(state)?;
            self.discard_staging();
            return Ok(None);
        }
        self.audit.info(
            "import",
            format!(
                "staged {} task(s), {} session(s), {} archived task(s)",
                report.imported.tasks, report.imported.sessions, report.imported.archived
            ),
        );
        Ok(Some(staging))
    }

    fn prepare_staging(&mut self) -> Result<PathBuf, MigrationError> {
        let target = self.layout.target.clone();
        let removed = self.swapper.cleanup_orphans(&target)?;
        if !removed.is_empty() {
            let message = format!("removed {} orphaned staging store(s)", removed.len());
            self.audit.warn("import", message);
        }

        let staging = match self.requested_staging.clone() {
            Some(path) => {
                for dir in [path.parent(), target.parent()].into_iter().flatten() {
                    if !dir.as_os_str().is_empty() {
                        self.fs.create_dir_all(dir).map_err(MigrationError::io("create dir", dir))?;
                    }
                }
                if self.fs.exists(&path) {
                    return Err(MigrationError::io("prepare staging", &path)(io::Error::from(
                        io::ErrorKind::AlreadyExists,
                    )));
                }
                path
            }
            None => self.swapper.stage_new_store(&target)?,
        };
        self.swapper.ensure_same_filesystem(&staging, &target)?;

        self.staging = Some(staging.clone());
        if self.fs.exists(&target) {
            self.fs.copy(&target, &staging).map_err(MigrationError::io("seed staging", &staging))?;
        }
        self.audit.info("import", format!("staging store at {}", staging.display()));
        Ok(staging)
    }

    fn verify(
        &mut self,
        state: &mut MigrationState,
        staging: &Path,
        totals: SourceCounts,
    ) -> Result<(), MigrationError> {
        self.enter(state, MigrationPhase::Verify)?;

        let store = TaskStore::open_read_only(staging)?;
        for kind in EntityKind::ALL {
            let actual = store.count(kind)?;
            let expected = totals.get(kind);
            if actual != expected {
                return Err(MigrationError::CountMismatch { kind: kind.as_str(), expected, actual });
            }
        }
        let integrity = store.integrity_check()?;
        store.close()?;
        if !integrity.is_healthy() {
            return Err(MigrationError::Integrity(format!(
                "quick_check: {}; foreign key violations: {}; pending schema versions: {:?}",
                integrity.quick_check_message,
                integrity.foreign_key_violations.len(),
                integrity.schema_status.pending_versions
            )));
        }
        self.checker.check_sources(&state.source_files, &self.layout.sources())?.into_result()?;

        let staged_digest = self.checker.digest(staging)?;
        let target = self.layout.target.clone();
        self.swapper.publish(staging, &target)?;
        self.published = true;
        self.staging = None;
        self.checker.verify(&target, &staged_digest)?;
        let message = format!("published {} (sha256 {staged_digest})", target.display());
        self.audit.info("verify", message);
        Ok(())
    }

    fn cleanup(&mut self, state: &mut MigrationState) -> Result<(), MigrationError> {
        self.enter(state, MigrationPhase::Cleanup)?;
        self.discard_staging();
        match self.swapper.cleanup_orphans(&self.layout.target) {
            Ok(removed) if !removed.is_empty() => {
                self.audit.info("cleanup", format!("removed {} staging store(s)", removed.len()));
            }
            Ok(_) => {}
            Err(err) => {
                let message = format!("could not scan for staging stores: {err}");
                self.audit.warn("cleanup", message.clone());
                state.add_warning(message);
            }
        }
        Ok(())
    }

    fn discard_staging(&mut self) {
        if let Some(staging) = self.staging.take() {
            if let Err(err) = self.swapper.discard(&staging) {
                self.audit.warn("cleanup", format!("failed to discard staging store: {err}"));
            }
        }
    }

    /// Put the pre-run target back. Returns whether anything changed.
    fn restore_target(&mut self, backup: Option<&BackupArtifact>) -> Result<bool, MigrationError> {
        let target = self.layout.target.clone();
        match backup {
            Some(artifact) => {
                let unchanged = self.fs.exists(&target)
                    && self.checker.digest(&target)? == artifact.source_checksum;
                if unchanged {
                    return Ok(false);
                }
                self.backups.restore(artifact, &target)?;
                Ok(true)
            }
            None => match self.fs.remove_file(&target) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(MigrationError::io("remove published target", &target)(err)),
            },
        }
    }

    fn succeed(mut self) -> MigrationResult {
        let log_path = flush_log(&mut self.audit);
        let Some(state) = self.state.take() else {
            let err = MigrationError::Integrity("run finished without a state".to_string());
            return MigrationResult::from_error(false, &err, log_path);
        };
        let skipped = state.skipped_reason.is_some();
        let progress = state.progress;
        MigrationResult {
            success: true,
            dry_run: false,
            phase: state.phase,
            tasks_imported: if skipped { 0 } else { progress.tasks_imported },
            sessions_imported: if skipped { 0 } else { progress.sessions_imported },
            archived_imported: if skipped { 0 } else { progress.archived_imported },
            source_counts: SourceCounts {
                tasks: progress.total_tasks,
                sessions: progress.total_sessions,
                archived: progress.total_archived,
            },
            skipped,
            resumed: self.resumed,
            restored: false,
            warnings: state.warnings,
            errors: Vec::new(),
            error_kind: None,
            backup: state.backup,
            log_path,
        }
    }

    fn fail(mut self, err: MigrationError) -> MigrationResult {
        let mut err = err;
        self.discard_staging();

        if self.published {
            let backup = self.state.as_ref().and_then(|state| state.backup.clone());
            match self.restore_target(backup.as_ref()) {
                Ok(restored) => {
                    self.restored = restored;
                    self.audit.warn("restore", "target returned to its pre-migration contents");
                }
                Err(restore) => {
                    err = MigrationError::RestoreFailed {
                        original: Box::new(err),
                        restore: Box::new(restore),
                    };
                }
            }
        }

        self.audit.error(err.kind(), err.to_string());
        let mut result = MigrationResult::from_error(false, &err, None);
        if let Some(state) = self.state.as_mut() {
            state.add_error(err.to_string());
            if let Err(save) = self.states.save(state) {
                warn!(error = %save, "failed to persist failed migration state");
            }
            result.warnings = state.warnings.clone();
            result.errors = state.errors.clone();
            result.backup = state.backup.clone();
            result.source_counts = SourceCounts {
                tasks: state.progress.total_tasks,
                sessions: state.progress.total_sessions,
                archived: state.progress.total_archived,
            };
        }
        result.resumed = self.resumed;
        result.restored = self.restored;
        result.log_path = flush_log(&mut self.audit);
        result
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn data_dir() -> Result<TempDir, MigrationError> {
        tempfile::tempdir().map_err(MigrationError::io("tempdir", Path::new(".")))
    }

    fn write(dir: &Path, name: &str, body: &str) -> Result<(), MigrationError> {
        let path = dir.join(name);
        std::fs::write(&path, body).map_err(MigrationError::io("write", &path))
    }

    #[test]
    fn failed_result_carries_error_kind() {
        let err = MigrationError::Lock("held".to_string());
        let result = MigrationResult::from_error(false, &err, None);
        assert!(!result.success);
        assert_eq!(result.phase, MigrationPhase::Failed);
        assert_eq!(result.error_kind, Some("lock"));
        assert_eq!(result.errors, vec!["lock error: held".to_string()]);
    }

    #[test]
    fn result_serializes_camel_case() -> Result<(), MigrationError> {
        let result = MigrationResult::empty(true, MigrationPhase::Validate);
        let value = serde_json::to_value(&result).map_err(MigrationError::json("result"))?;
        assert_eq!(value["dryRun"], true);
        assert_eq!(value["tasksImported"], 0);
        assert_eq!(value["phase"], "validate");
        assert!(value.get("errorKind").is_none());
        Ok(())
    }

    #[test]
    fn migrate_without_sources_warns_and_completes() -> Result<(), MigrationError> {
        let dir = data_dir()?;
        let migrator = Migrator::open(dir.path())?;
        let result = migrator.migrate(MigrateOptions::default());
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.phase, MigrationPhase::Complete);
        assert_eq!(result.tasks_imported, 0);
        assert_eq!(result.warnings.iter().filter(|w| w.contains("not found")).count(), 3);

        let report = migrator.verify_target()?;
        assert!(report.exists);
        assert!(report.healthy);
        Ok(())
    }

    #[test]
    fn dry_run_previews_counts_without_writing() -> Result<(), MigrationError> {
        let dir = data_dir()?;
        write(
            dir.path(),
            "todo.json",
            r#"{"tasks":[{"id":"T001","title":"a"},{"id":"T002","parentId":"T001"}]}"#,
        )?;
        let migrator = Migrator::open(dir.path())?;
        let result = migrator.migrate(MigrateOptions { dry_run: true, force: false });
        assert!(result.success, "{:?}", result.errors);
        assert!(result.dry_run);
        assert_eq!(result.source_counts.tasks, 2);
        assert_eq!(result.tasks_imported, 0);
        assert!(!dir.path().join("tasks.db").exists());
        assert_eq!(migrator.load_state()?, None);
        Ok(())
    }

    #[test]
    fn verify_target_reports_missing_store() -> Result<(), MigrationError> {
        let dir = data_dir()?;
        let report = Migrator::open(dir.path())?.verify_target()?;
        assert!(!report.exists);
        assert!(!report.healthy);
        assert_eq!(report.integrity, None);
        Ok(())
    }

    #[test]
    fn source_integrity_is_none_before_any_run() -> Result<(), MigrationError> {
        let dir = data_dir()?;
        assert_eq!(Migrator::open(dir.path())?.verify_source_integrity()?, None);
        Ok(())
    }
}
