use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::SourceCounts;

pub const STATE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StateError {
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: MigrationPhase, to: MigrationPhase },
    #[error("progress counter {counter} = {value} exceeds total {total}")]
    ProgressExceedsTotal { counter: &'static str, value: u64, total: u64 },
    #[error("cannot complete: {imported} of {total} tasks imported")]
    Incomplete { imported: u64, total: u64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    Init,
    Backup,
    Validate,
    Import,
    Verify,
    Cleanup,
    Complete,
    Failed,
}

impl MigrationPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Backup => "backup",
            Self::Validate => "validate",
            Self::Import => "import",
            Self::Verify => "verify",
            Self::Cleanup => "cleanup",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "init" => Some(Self::Init),
            "backup" => Some(Self::Backup),
            "validate" => Some(Self::Validate),
            "import" => Some(Self::Import),
            "verify" => Some(Self::Verify),
            "cleanup" => Some(Self::Cleanup),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Backup => 1,
            Self::Validate => 2,
            Self::Import => 3,
            Self::Verify => 4,
            Self::Cleanup => 5,
            Self::Complete => 6,
            Self::Failed => 7,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Phases a killed run may be resumed from.
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Backup | Self::Validate | Self::Import | Self::Verify)
    }

    /// Forward-only, except that `Failed` is reachable from any non-terminal
    /// phase. Re-entering the current phase is allowed so a resumed run can
    /// repeat it.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next.rank() >= self.rank()
    }
}

impl Display for MigrationPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest and size of one source document captured at `init`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_tasks: u64,
    pub tasks_imported: u64,
    pub total_sessions: u64,
    pub sessions_imported: u64,
    #[serde(default)]
    pub total_archived: u64,
    pub archived_imported: u64,
}

/// Counter update. Absent fields are left alone; present imported counters
/// only ever move forward.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ProgressDelta {
    pub totals: Option<SourceCounts>,
    pub tasks_imported: Option<u64>,
    pub sessions_imported: Option<u64>,
    pub archived_imported: Option<u64>,
}

impl ProgressDelta {
    #[must_use]
    pub fn totals(counts: SourceCounts) -> Self {
        Self { totals: Some(counts), ..Self::default() }
    }

    #[must_use]
    pub fn imported(counts: SourceCounts) -> Self {
        Self {
            totals: None,
            tasks_imported: Some(counts.tasks),
            sessions_imported: Some(counts.sessions),
            archived_imported: Some(counts.archived),
        }
    }
}

impl Progress {
    /// Merge `delta` into these counters.
    ///
    /// # Errors
    /// Returns [`StateError::ProgressExceedsTotal`] when an imported counter
    /// would exceed its total; the counters are left unchanged.
    pub fn merge(&mut self, delta: &ProgressDelta) -> Result<(), StateError> {
        let mut next = *self;
        if let Some(totals) = delta.totals {
            next.total_tasks = totals.tasks;
            next.total_sessions = totals.sessions;
            next.total_archived = totals.archived;
        }
        if let Some(value) = delta.tasks_imported {
            next.tasks_imported = next.tasks_imported.max(value);
        }
        if let Some(value) = delta.sessions_imported {
            next.sessions_imported = next.sessions_imported.max(value);
        }
        if let Some(value) = delta.archived_imported {
            next.archived_imported = next.archived_imported.max(value);
        }

        for (counter, value, total) in [
            ("tasksImported", next.tasks_imported, next.total_tasks),
            ("sessionsImported", next.sessions_imported, next.total_sessions),
            ("archivedImported", next.archived_imported, next.total_archived),
        ] {
            if value > total {
                return Err(StateError::ProgressExceedsTotal { counter, value, total });
            }
        }

        *self = next;
        Ok(())
    }
}

/// Snapshot of the target store taken before it is replaced.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub checksum: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Digest of the live target at the moment it was copied.
    pub source_checksum: String,
}

/// Persisted progress record for one migration run against one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    pub version: String,
    pub phase: MigrationPhase,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub source_files: BTreeMap<String, SourceFile>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub backup: Option<BackupArtifact>,
    /// The run replaces migrated data; a resumed run keeps this.
    #[serde(default)]
    pub forced: bool,
    /// Set when the run deliberately imported nothing (target already migrated).
    #[serde(default)]
    pub skipped_reason: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl MigrationState {
    #[must_use]
    pub fn new(started_at: OffsetDateTime) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            phase: MigrationPhase::Init,
            started_at,
            completed_at: None,
            source_files: BTreeMap::new(),
            progress: Progress::default(),
            backup: None,
            forced: false,
            skipped_reason: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// Returns [`StateError::InvalidTransition`] for backward moves or moves
    /// out of a terminal phase.
    pub fn advance(&mut self, next: MigrationPhase) -> Result<(), StateError> {
        if !self.phase.can_transition_to(next) {
            return Err(StateError::InvalidTransition { from: self.phase, to: next });
        }
        self.phase = next;
        Ok(())
    }

    /// Mark the run complete.
    ///
    /// # Errors
    /// Returns [`StateError::Incomplete`] when tasks remain unimported and the
    /// run was not a deliberate skip, or [`StateError::InvalidTransition`].
    pub fn complete(&mut self, at: OffsetDateTime) -> Result<(), StateError> {
        if self.skipped_reason.is_none() && self.progress.tasks_imported != self.progress.total_tasks
        {
            return Err(StateError::Incomplete {
                imported: self.progress.tasks_imported,
                total: self.progress.total_tasks,
            });
        }
        self.advance(MigrationPhase::Complete)?;
        self.completed_at = Some(at);
        Ok(())
    }

    /// Record a fatal error. Any error forces the run into `Failed`.
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        if self.phase != MigrationPhase::Complete {
            self.phase = MigrationPhase::Failed;
        }
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.errors.is_empty() && self.phase.is_resumable()
    }

    /// In progress: neither complete nor failed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }
}
