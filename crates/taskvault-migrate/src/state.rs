use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use taskvault_core::{MigrationPhase, MigrationState, ProgressDelta};
use time::OffsetDateTime;
use tracing::debug;

use crate::fs::FileSystem;
use crate::integrity::IntegrityChecker;
use crate::MigrationError;

/// Outcome of [`StateStore::can_resume`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeStatus {
    pub can_resume: bool,
    pub phase: Option<MigrationPhase>,
    pub reason: Option<String>,
}

/// Persistence for the single [`MigrationState`] of one target. Every mutation
/// is written through before it returns, via a temp file and rename, so a
/// reader never observes a half-written state.
#[derive(Debug, Clone)]
pub struct StateStore {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>, path: PathBuf) -> Self {
        Self { fs, path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    /// Returns [`MigrationError::Io`] on read failure and
    /// [`MigrationError::Json`] when the state file is corrupt.
    pub fn load(&self) -> Result<Option<MigrationState>, MigrationError> {
        let bytes = match self.fs.read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(MigrationError::io("read state", &self.path)(err)),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(MigrationError::json("migration state"))
    }

    /// # Errors
    /// Returns [`MigrationError::Io`] when the temp file cannot be written or
    /// renamed into place.
    pub fn save(&self, state: &MigrationState) -> Result<(), MigrationError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            self.fs.create_dir_all(parent).map_err(MigrationError::io("create state dir", parent))?;
        }
        let bytes =
            serde_json::to_vec_pretty(state).map_err(MigrationError::json("migration state"))?;
        let mut tmp: OsString = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        self.fs.write(&tmp, &bytes).map_err(MigrationError::io("write state", &tmp))?;
        self.fs.rename(&tmp, &self.path).map_err(MigrationError::io("commit state", &self.path))?;
        debug!(phase = %state.phase, path = %self.path.display(), "state persisted");
        Ok(())
    }

    /// Start a fresh state at `init`.
    ///
    /// # Errors
    /// Returns [`MigrationError::StateConflict`] when an active state exists
    /// and `force` is off.
    pub fn create(
        &self,
        started_at: OffsetDateTime,
        force: bool,
    ) -> Result<MigrationState, MigrationError> {
        if let Some(existing) = self.load()? {
            if existing.is_active() && !force {
                return Err(MigrationError::StateConflict {
                    phase: existing.phase,
                    reason: "an earlier run did not finish".to_string(),
                });
            }
        }
        let state = MigrationState::new(started_at);
        self.save(&state)?;
        Ok(state)
    }

    /// # Errors
    /// Returns [`MigrationError::State`] for an illegal transition; nothing is
    /// persisted in that case.
    pub fn advance_phase(
        &self,
        state: &mut MigrationState,
        phase: MigrationPhase,
    ) -> Result<(), MigrationError> {
        state.advance(phase)?;
        self.save(state)
    }

    /// # Errors
    /// Returns [`MigrationError::State`] when a counter would exceed its total.
    pub fn record_progress(
        &self,
        state: &mut MigrationState,
        delta: &ProgressDelta,
    ) -> Result<(), MigrationError> {
        state.progress.merge(delta)?;
        self.save(state)
    }

    /// Record a fatal error, moving the run to `failed`.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the state cannot be persisted.
    pub fn add_error(
        &self,
        state: &mut MigrationState,
        message: impl Into<String>,
    ) -> Result<(), MigrationError> {
        state.add_error(message);
        self.save(state)
    }

    /// # Errors
    /// Returns [`MigrationError::Io`] when the state cannot be persisted.
    pub fn add_warning(
        &self,
        state: &mut MigrationState,
        message: impl Into<String>,
    ) -> Result<(), MigrationError> {
        state.add_warning(message);
        self.save(state)
    }

    /// Whether the persisted run can be picked up where it stopped: it must be
    /// in a resumable phase with no errors, and its sources must be unchanged.
    ///
    /// # Errors
    /// Returns [`MigrationError`] when the state or a source cannot be read.
    pub fn can_resume(
        &self,
        checker: &IntegrityChecker,
        sources: &[(&'static str, PathBuf)],
    ) -> Result<ResumeStatus, MigrationError> {
        let Some(state) = self.load()? else {
            return Ok(ResumeStatus {
                can_resume: false,
                phase: None,
                reason: Some("no migration state".to_string()),
            });
        };
        let phase = Some(state.phase);
        if !state.is_resumable() {
            let reason = if state.errors.is_empty() {
                format!("phase {} is not resumable", state.phase)
            } else {
                format!("run recorded {} error(s)", state.errors.len())
            };
            return Ok(ResumeStatus { can_resume: false, phase, reason: Some(reason) });
        }

        let report = checker.check_sources(&state.source_files, sources)?;
        if let Some(changed) = report.files.iter().find(|file| !file.matches) {
            return Ok(ResumeStatus {
                can_resume: false,
                phase,
                reason: Some(format!("{} changed since the run started", changed.name)),
            });
        }
        Ok(ResumeStatus { can_resume: true, phase, reason: None })
    }
}
